// crates/core/src/manager.rs
//! Per-entity job lifecycle bookkeeping.
//!
//! A `JobManager` owns the active-job counter and metadata for one entity
//! type (trajectories, documents, ...). Workers call [`JobManager::increment`]
//! when a job starts and [`JobManager::decrement`] when it finishes. When the
//! counter reaches zero an [`EntityZero`] event goes out; the cleanup listener
//! reacts by re-verifying under the entity's lock that nothing is still in
//! flight before running the cleanup hook and dropping the bookkeeping keys.
//!
//! The counter can drift (a crashed worker never decrements), so it is only a
//! trigger. The status records scanned under the lock are authoritative.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use jobpulse_store::SharedStore;
use jobpulse_types::keys::{active_counter_pattern, entity_from_active_key};
use jobpulse_types::{
    now_millis, now_rfc3339, EntityJobMetadata, EntityKeys, JobOutcome, JobRecord, JobStatus,
    ACTIVE_STATUSES,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult};
use crate::lock::{LockManager, LockOutcome};
use crate::publish::JobUpdatePublisher;
use crate::scanner::{JobFilter, JobScanner};

/// Counter and metadata lifetime, refreshed on every increment.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const CLEANUP_LOCK_TTL: Duration = Duration::from_secs(60);
pub const HISTORY_LOCK_TTL: Duration = Duration::from_secs(120);

const ZERO_EVENT_CAPACITY: usize = 256;
/// Rescans `recount` makes before giving up on a busy counter.
const RECOUNT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// Entity kind, e.g. `trajectory`. Used in event names and as the default
    /// key prefix.
    pub entity_type: String,
    /// Field in job records holding the entity id, e.g. `trajectoryId`.
    pub entity_field: String,
    /// Queues whose status records belong to this entity type.
    pub queues: Vec<String>,
    pub key_prefix: Option<String>,
    pub ttl: Duration,
    pub cleanup_lock_ttl: Duration,
    pub history_lock_ttl: Duration,
}

impl JobManagerConfig {
    pub fn new(
        entity_type: impl Into<String>,
        entity_field: impl Into<String>,
        queues: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_field: entity_field.into(),
            queues: queues.into_iter().map(Into::into).collect(),
            key_prefix: None,
            ttl: DEFAULT_TTL,
            cleanup_lock_ttl: CLEANUP_LOCK_TTL,
            history_lock_ttl: HISTORY_LOCK_TTL,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn key_prefix(&self) -> &str {
        self.key_prefix.as_deref().unwrap_or(&self.entity_type)
    }
}

/// Identifies the job a worker is starting or finishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub entity_id: String,
    pub team_id: Option<String>,
    pub queue_type: String,
    pub job_id: String,
    pub session_id: Option<String>,
}

/// Emitted when an entity's active counter reaches zero (or below).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityZero {
    pub entity_id: String,
    pub team_id: Option<String>,
}

/// Domain hook run once an entity has verifiably no jobs in flight.
#[async_trait]
pub trait CleanupHandler: Send + Sync {
    async fn on_cleanup(&self, entity_id: &str, team_id: Option<&str>) -> anyhow::Result<()>;
}

/// Domain hook that removes artifacts tied to deleted jobs (chunks, exports,
/// ...). Returns how many were removed.
#[async_trait]
pub trait RelatedArtifacts: Send + Sync {
    async fn delete_related(&self, entity_id: &str, jobs: &[JobRecord]) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecrementResult {
    pub remaining: i64,
    pub is_zero: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The hook ran and the bookkeeping keys were removed.
    Cleaned,
    /// Counter and metadata were already gone; nothing to do.
    AlreadyClean,
    /// This process is already cleaning the entity.
    AlreadyInFlight,
    /// Another process holds the entity's lock.
    LockHeld,
    /// Status records still show this many active jobs.
    ActiveJobsRemain(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeleteResult {
    pub deleted_jobs: usize,
    pub deleted_related: usize,
}

pub struct JobManager {
    config: JobManagerConfig,
    store: SharedStore,
    scanner: JobScanner,
    locks: LockManager,
    publisher: JobUpdatePublisher,
    cleanup: Option<Arc<dyn CleanupHandler>>,
    in_flight: Mutex<HashSet<String>>,
    zero_tx: broadcast::Sender<EntityZero>,
}

/// Marks an entity as being cleaned by this process until dropped.
struct InFlightClaim<'a> {
    set: &'a Mutex<HashSet<String>>,
    entity_id: String,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.entity_id);
    }
}

impl JobManager {
    pub fn new(store: SharedStore, config: JobManagerConfig) -> Self {
        let (zero_tx, _) = broadcast::channel(ZERO_EVENT_CAPACITY);
        Self {
            scanner: JobScanner::new(store.clone()),
            locks: LockManager::new(store.clone()),
            publisher: JobUpdatePublisher::new(store.clone()),
            store,
            config,
            cleanup: None,
            in_flight: Mutex::new(HashSet::new()),
            zero_tx,
        }
    }

    pub fn with_cleanup_handler(mut self, handler: Arc<dyn CleanupHandler>) -> Self {
        self.cleanup = Some(handler);
        self
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    pub fn keys(&self, entity_id: &str) -> EntityKeys {
        EntityKeys::new(self.config.key_prefix(), entity_id)
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    /// Record a job start. Returns the new active count.
    pub async fn increment(&self, ctx: &JobContext) -> CoreResult<i64> {
        let keys = self.keys(&ctx.entity_id);
        let count = self
            .store
            .increment_active(&keys, &ctx.queue_type, now_millis(), self.config.ttl)
            .await?;

        tracing::info!(
            entity_type = %self.config.entity_type,
            entity_id = %ctx.entity_id,
            job_id = %ctx.job_id,
            queue = %ctx.queue_type,
            active = count,
            "job started"
        );
        Ok(count)
    }

    /// Record a job finish. A zero or negative result emits [`EntityZero`].
    pub async fn decrement(&self, ctx: &JobContext, outcome: JobOutcome) -> CoreResult<DecrementResult> {
        let keys = self.keys(&ctx.entity_id);
        let remaining = self
            .store
            .decrement_active(&keys, outcome, now_millis())
            .await?;
        let is_zero = remaining <= 0;

        if remaining < 0 {
            tracing::warn!(
                entity_id = %ctx.entity_id,
                job_id = %ctx.job_id,
                remaining,
                "active counter went negative"
            );
        }
        tracing::info!(
            entity_type = %self.config.entity_type,
            entity_id = %ctx.entity_id,
            job_id = %ctx.job_id,
            outcome = outcome.as_str(),
            remaining,
            "job finished"
        );

        if is_zero {
            // no receivers is fine: nobody asked for automatic cleanup
            let _ = self.zero_tx.send(EntityZero {
                entity_id: ctx.entity_id.clone(),
                team_id: ctx.team_id.clone(),
            });
        }
        Ok(DecrementResult { remaining, is_zero })
    }

    /// Current counter value; a missing counter reads as 0.
    pub async fn active_count(&self, entity_id: &str) -> CoreResult<i64> {
        let key = self.keys(entity_id).active;
        match self.store.get(&key).await? {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| CoreError::Store(jobpulse_store::StoreError::NotInteger { key })),
            None => Ok(0),
        }
    }

    /// Metadata hash plus queue set, or `None` if neither exists.
    pub async fn metadata(&self, entity_id: &str) -> CoreResult<Option<EntityJobMetadata>> {
        let keys = self.keys(entity_id);
        let hash = self.store.hash_get_all(&keys.metadata).await?;
        let queues = self.store.set_members(&keys.queues).await?;
        if hash.is_empty() && queues.is_empty() {
            return Ok(None);
        }
        Ok(Some(EntityJobMetadata::from_hash(&hash, queues)))
    }

    /// Reset the counter to the number of active status records. The write
    /// only lands if the counter did not move during the scan; otherwise the
    /// scan is repeated.
    pub async fn recount(&self, entity_id: &str) -> CoreResult<i64> {
        let key = self.keys(entity_id).active;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let previous = self.store.get(&key).await?;
            let active = self.scan_jobs(entity_id, Some(&ACTIVE_STATUSES)).await?.len() as i64;
            let written = self
                .store
                .compare_and_set(&key, previous.as_deref(), &active.to_string(), self.config.ttl)
                .await?;

            if written {
                if previous.as_deref().map(str::trim) != Some(active.to_string().as_str()) {
                    tracing::info!(entity_id, previous = ?previous, active, "active counter corrected");
                }
                return Ok(active);
            }
            if attempt >= RECOUNT_ATTEMPTS {
                tracing::warn!(entity_id, attempt, "counter kept moving during recount; leaving it as is");
                return self.active_count(entity_id).await;
            }
            tracing::debug!(entity_id, attempt, "counter changed during recount, rescanning");
        }
    }

    /// Recount every entity that currently has a counter. Used at startup to
    /// repair drift left by crashed workers. Returns how many were recounted.
    pub async fn recover_counters(&self) -> CoreResult<usize> {
        let prefix = self.config.key_prefix();
        let keys = self.scanner.scan_keys(&active_counter_pattern(prefix)).await?;
        let entities: BTreeSet<&str> = keys
            .iter()
            .filter_map(|key| entity_from_active_key(prefix, key))
            .collect();

        let mut recovered = 0;
        for entity_id in entities {
            match self.recount(entity_id).await {
                Ok(_) => recovered += 1,
                Err(e) => tracing::warn!(entity_id, error = %e, "counter recovery failed"),
            }
        }
        tracing::info!(entity_type = %self.config.entity_type, recovered, "counter recovery complete");
        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Status records for `entity_id` across all configured queues,
    /// optionally restricted to `statuses`.
    pub async fn scan_jobs(
        &self,
        entity_id: &str,
        statuses: Option<&[JobStatus]>,
    ) -> CoreResult<Vec<JobRecord>> {
        let mut filter = JobFilter::entity(&self.config.entity_field, entity_id);
        if let Some(statuses) = statuses {
            filter = filter.with_statuses(statuses);
        }
        self.scanner.scan_queues(&self.config.queues, &filter).await
    }

    pub async fn has_active_jobs(&self, entity_id: &str) -> CoreResult<bool> {
        Ok(!self.scan_jobs(entity_id, Some(&ACTIVE_STATUSES)).await?.is_empty())
    }

    pub async fn get_failed_jobs(&self, entity_id: &str) -> CoreResult<Vec<JobRecord>> {
        self.scan_jobs(entity_id, Some(&[JobStatus::Failed])).await
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Subscribe to zero-crossing events.
    pub fn subscribe_zero(&self) -> broadcast::Receiver<EntityZero> {
        self.zero_tx.subscribe()
    }

    /// Run [`JobManager::verify_and_cleanup`] for every zero-crossing, each
    /// on its own task. Abort the returned handle to stop listening.
    pub fn spawn_cleanup_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = self.zero_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move { manager.handle_zero(event).await });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "cleanup listener lagged; some zero events were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_zero(&self, event: EntityZero) {
        match self
            .verify_and_cleanup(&event.entity_id, event.team_id.as_deref())
            .await
        {
            Ok(outcome) => {
                tracing::debug!(entity_id = %event.entity_id, ?outcome, "zero-crossing handled")
            }
            Err(e) => {
                tracing::error!(entity_id = %event.entity_id, error = %e, "cleanup after zero-crossing failed")
            }
        }
    }

    /// Re-check under the entity's cleanup lock that no active jobs remain,
    /// then run the cleanup hook and remove the counter and metadata.
    ///
    /// Concurrent calls for the same entity collapse: within a process via
    /// the in-flight set, across processes via the lock. A hook failure is
    /// returned as [`CoreError::CleanupFailed`] and leaves the bookkeeping
    /// keys in place.
    pub async fn verify_and_cleanup(
        &self,
        entity_id: &str,
        team_id: Option<&str>,
    ) -> CoreResult<CleanupOutcome> {
        let Some(_claim) = self.claim(entity_id) else {
            tracing::debug!(entity_id, "cleanup already in flight");
            return Ok(CleanupOutcome::AlreadyInFlight);
        };

        let lock_key = self.keys(entity_id).lock;
        let outcome = self
            .locks
            .with_lock(&lock_key, self.config.cleanup_lock_ttl, || {
                self.cleanup_locked(entity_id, team_id)
            })
            .await?;

        match outcome {
            LockOutcome::Acquired(result) => result,
            LockOutcome::Contended => {
                tracing::debug!(entity_id, "cleanup lock held elsewhere");
                Ok(CleanupOutcome::LockHeld)
            }
        }
    }

    fn claim(&self, entity_id: &str) -> Option<InFlightClaim<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(entity_id.to_string()) {
            return None;
        }
        Some(InFlightClaim {
            set: &self.in_flight,
            entity_id: entity_id.to_string(),
        })
    }

    async fn cleanup_locked(&self, entity_id: &str, team_id: Option<&str>) -> CoreResult<CleanupOutcome> {
        let keys = self.keys(entity_id);
        let counter = self.store.get(&keys.active).await?;
        let metadata = self.store.hash_get_all(&keys.metadata).await?;
        if counter.is_none() && metadata.is_empty() {
            return Ok(CleanupOutcome::AlreadyClean);
        }

        let active = self.scan_jobs(entity_id, Some(&ACTIVE_STATUSES)).await?;
        if !active.is_empty() {
            tracing::warn!(
                entity_id,
                active = active.len(),
                "counter reached zero but active jobs remain; skipping cleanup"
            );
            return Ok(CleanupOutcome::ActiveJobsRemain(active.len()));
        }

        if let Some(handler) = &self.cleanup {
            if let Err(source) = handler.on_cleanup(entity_id, team_id).await {
                tracing::error!(entity_id, error = %source, "cleanup hook failed");
                return Err(CoreError::CleanupFailed {
                    entity_id: entity_id.to_string(),
                    source,
                });
            }
        }

        self.clear_bookkeeping(&keys).await?;
        tracing::info!(entity_type = %self.config.entity_type, entity_id, "entity cleaned up");
        Ok(CleanupOutcome::Cleaned)
    }

    async fn clear_bookkeeping(&self, keys: &EntityKeys) -> CoreResult<()> {
        self.store.delete(&keys.bookkeeping()).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bulk deletion
    // ------------------------------------------------------------------

    /// Delete every job record for the entity, its related artifacts and its
    /// bookkeeping, then announce `<entity_type>_history_cleared`.
    ///
    /// Fails with [`CoreError::LockConflict`] if a cleanup or another bulk
    /// deletion holds the entity's lock.
    pub async fn clear_history(
        &self,
        entity_id: &str,
        team_id: &str,
        related: Option<&dyn RelatedArtifacts>,
    ) -> CoreResult<BulkDeleteResult> {
        let lock_key = self.keys(entity_id).lock;
        let outcome = self
            .locks
            .with_lock(&lock_key, self.config.history_lock_ttl, || {
                self.clear_history_locked(entity_id, team_id, related)
            })
            .await?;
        self.locked_result(entity_id, outcome)
    }

    async fn clear_history_locked(
        &self,
        entity_id: &str,
        team_id: &str,
        related: Option<&dyn RelatedArtifacts>,
    ) -> CoreResult<BulkDeleteResult> {
        let jobs = self.scan_jobs(entity_id, None).await?;
        let deleted_jobs = self.scanner.delete_jobs(&jobs).await;
        let deleted_related = self.delete_related(entity_id, &jobs, related).await?;
        self.clear_bookkeeping(&self.keys(entity_id)).await?;

        let event = format!("{}_history_cleared", self.config.entity_type);
        self.publish_event(entity_id, team_id, &event).await?;

        tracing::info!(entity_id, deleted_jobs, deleted_related, "job history cleared");
        Ok(BulkDeleteResult {
            deleted_jobs,
            deleted_related,
        })
    }

    /// Delete only the entity's queued, running and retrying jobs, then
    /// announce `<entity_type>_active_jobs_removed`. Bookkeeping is cleared
    /// only if no job records remain at all.
    pub async fn remove_active_jobs(
        &self,
        entity_id: &str,
        team_id: &str,
        related: Option<&dyn RelatedArtifacts>,
    ) -> CoreResult<BulkDeleteResult> {
        let lock_key = self.keys(entity_id).lock;
        let outcome = self
            .locks
            .with_lock(&lock_key, self.config.history_lock_ttl, || {
                self.remove_active_locked(entity_id, team_id, related)
            })
            .await?;
        self.locked_result(entity_id, outcome)
    }

    async fn remove_active_locked(
        &self,
        entity_id: &str,
        team_id: &str,
        related: Option<&dyn RelatedArtifacts>,
    ) -> CoreResult<BulkDeleteResult> {
        let jobs = self.scan_jobs(entity_id, Some(&ACTIVE_STATUSES)).await?;
        if jobs.is_empty() {
            tracing::debug!(entity_id, "no active jobs to remove");
            return Ok(BulkDeleteResult::default());
        }

        let deleted_jobs = self.scanner.delete_jobs(&jobs).await;
        let deleted_related = self.delete_related(entity_id, &jobs, related).await?;

        if self.scan_jobs(entity_id, None).await?.is_empty() {
            self.clear_bookkeeping(&self.keys(entity_id)).await?;
        }

        let event = format!("{}_active_jobs_removed", self.config.entity_type);
        self.publish_event(entity_id, team_id, &event).await?;

        tracing::info!(entity_id, deleted_jobs, deleted_related, "active jobs removed");
        Ok(BulkDeleteResult {
            deleted_jobs,
            deleted_related,
        })
    }

    fn locked_result<T>(
        &self,
        entity_id: &str,
        outcome: LockOutcome<CoreResult<T>>,
    ) -> CoreResult<T> {
        match outcome {
            LockOutcome::Acquired(result) => result,
            LockOutcome::Contended => {
                tracing::warn!(entity_id, "entity lock held; rejecting bulk deletion");
                Err(CoreError::LockConflict {
                    entity_id: entity_id.to_string(),
                })
            }
        }
    }

    async fn delete_related(
        &self,
        entity_id: &str,
        jobs: &[JobRecord],
        related: Option<&dyn RelatedArtifacts>,
    ) -> CoreResult<usize> {
        let Some(related) = related else {
            return Ok(0);
        };
        related
            .delete_related(entity_id, jobs)
            .await
            .map_err(|source| CoreError::RelatedCleanupFailed {
                entity_id: entity_id.to_string(),
                source,
            })
    }

    /// Publish an entity-level event (`{type, <entity_field>, teamId,
    /// timestamp}`) to the team's clients.
    pub async fn publish_event(&self, entity_id: &str, team_id: &str, event_type: &str) -> CoreResult<()> {
        let mut payload = Map::new();
        payload.insert("type".into(), Value::from(event_type));
        payload.insert(self.config.entity_field.clone(), Value::from(entity_id));
        payload.insert("teamId".into(), Value::from(team_id));
        payload.insert("timestamp".into(), Value::from(now_rfc3339()));

        self.publisher.publish(team_id, Value::Object(payload)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobpulse_store::{CoordinationStore, MemoryStore};
    use pretty_assertions::assert_eq;

    fn manager() -> (JobManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = JobManagerConfig::new("trajectory", "trajectoryId", ["analysis"]);
        (JobManager::new(store.clone(), config), store)
    }

    fn ctx(entity: &str, job: &str) -> JobContext {
        JobContext {
            entity_id: entity.into(),
            team_id: Some("team-1".into()),
            queue_type: "analysis".into(),
            job_id: job.into(),
            session_id: None,
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = JobManagerConfig::new("trajectory", "trajectoryId", ["analysis", "export"]);
        assert_eq!(config.key_prefix(), "trajectory");
        assert_eq!(config.ttl, Duration::from_secs(604_800));
        assert_eq!(config.queues, vec!["analysis".to_string(), "export".to_string()]);
        assert_eq!(config.with_key_prefix("traj").key_prefix(), "traj");
    }

    #[tokio::test]
    async fn test_increment_and_decrement_track_metadata() {
        let (manager, _) = manager();

        assert_eq!(manager.increment(&ctx("e1", "a")).await.unwrap(), 1);
        assert_eq!(manager.increment(&ctx("e1", "b")).await.unwrap(), 2);

        let result = manager
            .decrement(&ctx("e1", "a"), JobOutcome::Completed)
            .await
            .unwrap();
        assert_eq!(result, DecrementResult { remaining: 1, is_zero: false });
        assert_eq!(manager.active_count("e1").await.unwrap(), 1);

        let meta = manager.metadata("e1").await.unwrap().unwrap();
        assert_eq!(meta.total_added, 2);
        assert_eq!(meta.total_completed, 1);
        assert!(meta.first_job_at.is_some());
        assert!(meta.queues.contains("analysis"));
    }

    #[tokio::test]
    async fn test_zero_crossing_emits_event() {
        let (manager, _) = manager();
        let mut zero = manager.subscribe_zero();

        manager.increment(&ctx("e1", "a")).await.unwrap();
        let result = manager
            .decrement(&ctx("e1", "a"), JobOutcome::Failed)
            .await
            .unwrap();

        assert!(result.is_zero);
        assert_eq!(
            zero.recv().await.unwrap(),
            EntityZero {
                entity_id: "e1".into(),
                team_id: Some("team-1".into())
            }
        );
    }

    #[tokio::test]
    async fn test_negative_counter_still_counts_as_zero() {
        let (manager, _) = manager();
        let result = manager
            .decrement(&ctx("e1", "ghost"), JobOutcome::Completed)
            .await
            .unwrap();
        assert_eq!(result, DecrementResult { remaining: -1, is_zero: true });
    }

    #[tokio::test]
    async fn test_missing_metadata_reads_as_none() {
        let (manager, _) = manager();
        assert_eq!(manager.metadata("nobody").await.unwrap(), None);
        assert_eq!(manager.active_count("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_skips_entity_already_cleaned() {
        let (manager, _) = manager();
        let outcome = manager.verify_and_cleanup("e1", None).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::AlreadyClean);
    }

    #[tokio::test]
    async fn test_in_flight_claim_is_released_on_drop() {
        let (manager, _) = manager();
        {
            let _claim = manager.claim("e1").unwrap();
            assert!(manager.claim("e1").is_none());
        }
        assert!(manager.claim("e1").is_some());
    }

    #[tokio::test]
    async fn test_cleanup_reports_lock_held() {
        let (manager, store) = manager();
        manager.increment(&ctx("e1", "a")).await.unwrap();
        store
            .set_if_absent(&manager.keys("e1").lock, "other:1", Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = manager.verify_and_cleanup("e1", None).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::LockHeld);
    }

    #[tokio::test]
    async fn test_bulk_delete_rejected_while_locked() {
        let (manager, store) = manager();
        store
            .set_if_absent(&manager.keys("e1").lock, "other:1", Duration::from_secs(60))
            .await
            .unwrap();

        let err = manager.clear_history("e1", "team-1", None).await.unwrap_err();
        assert!(matches!(err, CoreError::LockConflict { ref entity_id } if entity_id == "e1"));
        assert!(err.is_retryable());
    }
}
