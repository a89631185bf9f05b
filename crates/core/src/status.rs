// crates/core/src/status.rs
//! Worker-side status writes.
//!
//! A worker reports progress by rewriting its job's status record. The write
//! also keeps the team index current and pushes the new record to connected
//! clients through `job_updates`.

use std::time::Duration;

use jobpulse_store::SharedStore;
use jobpulse_types::keys::{status_key, team_jobs_key};
use jobpulse_types::{now_rfc3339, JobRecord};

use crate::error::CoreResult;
use crate::publish::JobUpdatePublisher;

/// How long a status record outlives its last write.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct JobStatusWriter {
    store: SharedStore,
    publisher: JobUpdatePublisher,
    ttl: Duration,
}

impl JobStatusWriter {
    pub fn new(store: SharedStore) -> Self {
        Self {
            publisher: JobUpdatePublisher::new(store.clone()),
            store,
            ttl: DEFAULT_STATUS_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Store `record` under `queue`, stamping its queue and timestamp, index
    /// it for its team, and publish it. Returns the record as written.
    pub async fn set_job_status(&self, queue: &str, mut record: JobRecord) -> CoreResult<JobRecord> {
        record.queue_type = queue.to_string();
        record.timestamp = Some(now_rfc3339());

        let raw = serde_json::to_string(&record)?;
        self.store
            .set_with_ttl(&status_key(queue, &record.job_id), &raw, self.ttl)
            .await?;

        if let Some(team_id) = record.team_id.as_deref().filter(|t| !t.is_empty()) {
            self.store
                .set_add(&team_jobs_key(team_id), &record.job_id)
                .await?;
            self.publisher
                .publish(team_id, serde_json::to_value(&record)?)
                .await?;
        }

        tracing::debug!(
            job_id = %record.job_id,
            queue,
            status = %record.status,
            progress = record.progress,
            "job status written"
        );
        Ok(record)
    }
}
