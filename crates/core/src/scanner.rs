// crates/core/src/scanner.rs
//! Locating and deleting job status records.
//!
//! Status records live under `{queue}_queue:status:{jobId}` and are found by
//! incremental `SCAN`, never a blocking key listing. Each page of keys is
//! fetched in one pipelined round trip. Team snapshots go through the
//! `team:{teamId}:jobs` index set instead of scanning.

use std::collections::HashMap;

use futures_util::future::try_join_all;
use jobpulse_store::SharedStore;
use jobpulse_types::keys::{retry_key, status_key, status_pattern, team_jobs_key};
use jobpulse_types::{JobRecord, JobStatus};

use crate::error::CoreResult;

/// Keys examined per `SCAN` call.
pub const SCAN_BATCH: usize = 100;
/// Status keys fetched per pipeline when building a team snapshot.
pub const SNAPSHOT_BATCH: usize = 500;

/// Predicate applied to each parsed record during a scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter<'a> {
    /// `(field name, expected value)`, e.g. `("trajectoryId", "traj-1")`.
    pub entity: Option<(&'a str, &'a str)>,
    pub statuses: Option<&'a [JobStatus]>,
}

impl<'a> JobFilter<'a> {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn entity(field: &'a str, entity_id: &'a str) -> Self {
        Self {
            entity: Some((field, entity_id)),
            statuses: None,
        }
    }

    pub fn with_statuses(mut self, statuses: &'a [JobStatus]) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some((field, expected)) = self.entity {
            if record.field_str(field) != Some(expected) {
                return false;
            }
        }
        match self.statuses {
            Some(statuses) => statuses.contains(&record.status),
            None => true,
        }
    }
}

#[derive(Clone)]
pub struct JobScanner {
    store: SharedStore,
    batch_size: usize,
    snapshot_batch: usize,
}

impl JobScanner {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            batch_size: SCAN_BATCH,
            snapshot_batch: SNAPSHOT_BATCH,
        }
    }

    pub fn with_batch_sizes(mut self, scan: usize, snapshot: usize) -> Self {
        self.batch_size = scan.max(1);
        self.snapshot_batch = snapshot.max(1);
        self
    }

    /// Every key matching `pattern`, walking the cursor to completion.
    pub async fn scan_keys(&self, pattern: &str) -> CoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.store.scan_match(cursor, pattern, self.batch_size).await?;
            keys.extend(page.keys);
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// Parse every record under `pattern` that passes `filter`.
    ///
    /// Missing or unparseable values are skipped; records can expire or be
    /// half-written between the scan and the fetch.
    pub async fn scan(&self, pattern: &str, filter: &JobFilter<'_>) -> CoreResult<Vec<JobRecord>> {
        let mut jobs = Vec::new();
        let mut scanned = 0usize;
        let mut cursor = 0;
        loop {
            let page = self.store.scan_match(cursor, pattern, self.batch_size).await?;
            scanned += page.keys.len();

            if !page.keys.is_empty() {
                let values = self.store.get_many(&page.keys).await?;
                for (key, raw) in page.keys.iter().zip(values) {
                    let Some(raw) = raw else { continue };
                    match serde_json::from_str::<JobRecord>(&raw) {
                        Ok(record) if filter.matches(&record) => jobs.push(record),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(key = %key, error = %e, "skipping unparseable job record")
                        }
                    }
                }
            }

            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        tracing::debug!(pattern, scanned, matched = jobs.len(), "job scan complete");
        Ok(jobs)
    }

    /// Scan each queue's status keys and tag results with the queue name.
    pub async fn scan_queues(
        &self,
        queues: &[String],
        filter: &JobFilter<'_>,
    ) -> CoreResult<Vec<JobRecord>> {
        let mut all = Vec::new();
        for queue in queues {
            let mut found = self.scan(&status_pattern(queue), filter).await?;
            for record in &mut found {
                record.queue_type = queue.clone();
            }
            all.extend(found);
        }
        Ok(all)
    }

    /// Remove a job's status record and retry counter, and drop it from its
    /// team's index.
    pub async fn delete_job(&self, job: &JobRecord) -> CoreResult<()> {
        let mut keys = vec![retry_key(&job.job_id)];
        if !job.queue_type.is_empty() {
            keys.push(status_key(&job.queue_type, &job.job_id));
        }
        self.store.delete(&keys).await?;

        if let Some(team_id) = job.team_id.as_deref().filter(|t| !t.is_empty()) {
            self.store
                .set_remove(&team_jobs_key(team_id), &job.job_id)
                .await?;
        }
        Ok(())
    }

    /// Delete each job, logging individual failures. Returns how many were
    /// removed.
    pub async fn delete_jobs(&self, jobs: &[JobRecord]) -> usize {
        let mut deleted = 0;
        for job in jobs {
            match self.delete_job(job).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::error!(
                    job_id = %job.job_id,
                    queue = %job.queue_type,
                    error = %e,
                    "failed to delete job"
                ),
            }
        }
        tracing::info!(deleted, requested = jobs.len(), "deleted jobs");
        deleted
    }

    /// All jobs recorded for a team across `queues`: one entry per job id
    /// (latest timestamp wins), newest first.
    pub async fn team_snapshot(&self, team_id: &str, queues: &[String]) -> CoreResult<Vec<JobRecord>> {
        let job_ids = self.store.set_members(&team_jobs_key(team_id)).await?;
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }

        let per_queue = try_join_all(
            queues
                .iter()
                .map(|queue| self.team_jobs_in_queue(team_id, queue, &job_ids)),
        )
        .await?;

        let mut latest: HashMap<String, JobRecord> = HashMap::new();
        for record in per_queue.into_iter().flatten() {
            match latest.get(&record.job_id) {
                Some(existing) if existing.timestamp_millis() >= record.timestamp_millis() => {}
                _ => {
                    latest.insert(record.job_id.clone(), record);
                }
            }
        }

        let mut jobs: Vec<JobRecord> = latest.into_values().collect();
        jobs.sort_by(|a, b| {
            b.timestamp_millis()
                .cmp(&a.timestamp_millis())
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(jobs)
    }

    async fn team_jobs_in_queue(
        &self,
        team_id: &str,
        queue: &str,
        job_ids: &[String],
    ) -> CoreResult<Vec<JobRecord>> {
        let mut jobs = Vec::new();
        for chunk in job_ids.chunks(self.snapshot_batch) {
            let keys: Vec<String> = chunk.iter().map(|id| status_key(queue, id)).collect();
            let values = self.store.get_many(&keys).await?;
            for (key, raw) in keys.iter().zip(values) {
                let Some(raw) = raw else { continue };
                let mut record = match serde_json::from_str::<JobRecord>(&raw) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping unparseable job record");
                        continue;
                    }
                };
                if record.team_id.as_deref() != Some(team_id) {
                    continue;
                }
                if record.queue_type.is_empty() {
                    record.queue_type = queue.to_string();
                }
                jobs.push(record);
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobpulse_store::{CoordinationStore, MemoryStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(3600);

    async fn put(store: &MemoryStore, queue: &str, value: serde_json::Value) {
        let id = value["jobId"].as_str().unwrap().to_string();
        store
            .set_with_ttl(&status_key(queue, &id), &value.to_string(), TTL)
            .await
            .unwrap();
        if let Some(team) = value["teamId"].as_str() {
            store.set_add(&team_jobs_key(team), &id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_scan_filters_entity_and_status() {
        let store = Arc::new(MemoryStore::new());
        put(&store, "analysis", json!({"jobId": "a", "trajectoryId": "t1", "status": "running"})).await;
        put(&store, "analysis", json!({"jobId": "b", "trajectoryId": "t1", "status": "completed"})).await;
        put(&store, "analysis", json!({"jobId": "c", "trajectoryId": "t2", "status": "queued"})).await;
        store
            .set_with_ttl("analysis_queue:status:broken", "{not json", TTL)
            .await
            .unwrap();

        let scanner = JobScanner::new(store.clone()).with_batch_sizes(2, 2);
        let active = [JobStatus::Queued, JobStatus::Running, JobStatus::Retrying];
        let filter = JobFilter::entity("trajectoryId", "t1").with_statuses(&active);
        let found = scanner
            .scan_queues(&["analysis".to_string()], &filter)
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].job_id, "a");
        assert_eq!(found[0].queue_type, "analysis");

        let all = scanner
            .scan(&status_pattern("analysis"), &JobFilter::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_job_removes_status_retry_and_team_entry() {
        let store = Arc::new(MemoryStore::new());
        put(&store, "analysis", json!({"jobId": "a", "teamId": "team-1", "status": "running"})).await;
        store.set_with_ttl(&retry_key("a"), "2", TTL).await.unwrap();

        let scanner = JobScanner::new(store.clone());
        let found = scanner
            .scan_queues(&["analysis".to_string()], &JobFilter::all())
            .await
            .unwrap();
        assert_eq!(scanner.delete_jobs(&found).await, 1);

        assert_eq!(store.get(&status_key("analysis", "a")).await.unwrap(), None);
        assert_eq!(store.get(&retry_key("a")).await.unwrap(), None);
        assert!(store.set_members(&team_jobs_key("team-1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_team_snapshot_dedupes_and_sorts_newest_first() {
        let store = Arc::new(MemoryStore::new());
        put(&store, "analysis", json!({
            "jobId": "j1", "teamId": "team-1", "status": "running",
            "timestamp": "2026-02-05T12:00:00.000Z"
        }))
        .await;
        // same job id, newer record in another queue
        put(&store, "export", json!({
            "jobId": "j1", "teamId": "team-1", "status": "completed",
            "timestamp": "2026-02-05T12:05:00.000Z"
        }))
        .await;
        put(&store, "analysis", json!({
            "jobId": "j2", "teamId": "team-1", "status": "queued",
            "timestamp": "2026-02-05T12:01:00.000Z"
        }))
        .await;
        // listed in the team set but owned by another team
        put(&store, "analysis", json!({
            "jobId": "j3", "teamId": "team-2", "status": "queued",
            "timestamp": "2026-02-05T12:02:00.000Z"
        }))
        .await;
        store.set_add(&team_jobs_key("team-1"), "j3").await.unwrap();

        let scanner = JobScanner::new(store.clone()).with_batch_sizes(100, 1);
        let queues = vec!["analysis".to_string(), "export".to_string()];
        let jobs = scanner.team_snapshot("team-1", &queues).await.unwrap();

        let ids: Vec<(&str, &str)> = jobs
            .iter()
            .map(|j| (j.job_id.as_str(), j.status.as_str()))
            .collect();
        assert_eq!(ids, vec![("j1", "completed"), ("j2", "queued")]);
        assert_eq!(jobs[0].queue_type, "export");
    }

    #[tokio::test]
    async fn test_team_snapshot_empty_team() {
        let store = Arc::new(MemoryStore::new());
        let scanner = JobScanner::new(store);
        let jobs = scanner
            .team_snapshot("nobody", &["analysis".to_string()])
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }
}
