// crates/types/src/job.rs
//! Job status records as workers write them to the coordination store.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Lifecycle status of a background job.
///
/// Workers occasionally write statuses outside the core set (e.g. a requeue
/// marker after a restart). Those are kept verbatim in `Other` so the record
/// still shows up in snapshots instead of being dropped as unparseable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Other(String),
}

/// Statuses that count as "still in flight" for an entity.
pub const ACTIVE_STATUSES: [JobStatus; 3] =
    [JobStatus::Queued, JobStatus::Running, JobStatus::Retrying];

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Other(s) => s,
        }
    }

    pub fn is_active(&self) -> bool {
        ACTIVE_STATUSES.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "retrying" => JobStatus::Retrying,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Other(s),
        }
    }
}

impl From<&str> for JobStatus {
    fn from(s: &str) -> Self {
        JobStatus::from(s.to_string())
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job's status record, stored as JSON under `{queue}_queue:status:{jobId}`.
///
/// Fields the tracker does not interpret (domain ids such as `trajectoryId`,
/// chunk counters, session ids) are preserved in `extra` so a record survives
/// a read/write cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default)]
    pub queue_type: String,
    pub status: JobStatus,
    #[serde(default, deserialize_with = "progress_or_zero")]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn progress_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.as_ref().and_then(Value::as_f64).unwrap_or(0.0))
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            entity_id: None,
            team_id: None,
            queue_type: String::new(),
            status,
            progress: 0.0,
            timestamp: None,
            error: None,
            result: None,
            extra: Map::new(),
        }
    }

    /// Look up a string field by its wire name.
    ///
    /// Entity matching is configured by field name (`trajectoryId`,
    /// `entityId`, ...), so this resolves both the typed fields and anything
    /// carried in `extra`.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        match name {
            "jobId" => Some(self.job_id.as_str()),
            "entityId" => self.entity_id.as_deref(),
            "teamId" => self.team_id.as_deref(),
            "queueType" => Some(self.queue_type.as_str()),
            "status" => Some(self.status.as_str()),
            _ => self.extra.get(name).and_then(Value::as_str),
        }
    }

    /// Timestamp in epoch milliseconds; missing or unparseable reads as 0.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp
            .as_deref()
            .and_then(|ts| {
                chrono::DateTime::parse_from_rfc3339(ts)
                    .map(|dt| dt.timestamp_millis())
                    .ok()
                    .or_else(|| ts.parse::<i64>().ok())
            })
            .unwrap_or(0)
    }
}
