// crates/types/src/metadata.rs
//! Per-entity job bookkeeping kept alongside the active counter.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Terminal outcome reported when a job leaves the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Failed,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
        }
    }

    /// Metadata hash field bumped for this outcome.
    pub fn counter_field(self) -> &'static str {
        match self {
            JobOutcome::Completed => "totalCompleted",
            JobOutcome::Failed => "totalFailed",
        }
    }
}

/// Snapshot of an entity's metadata hash plus its queue set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityJobMetadata {
    pub total_added: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub first_job_at: Option<i64>,
    pub last_job_at: Option<i64>,
    pub queues: BTreeSet<String>,
}

impl EntityJobMetadata {
    /// Build from the raw hash fields; unknown or malformed fields read as unset.
    pub fn from_hash(hash: &HashMap<String, String>, queues: impl IntoIterator<Item = String>) -> Self {
        let num = |field: &str| hash.get(field).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let ts = |field: &str| hash.get(field).and_then(|v| v.parse::<i64>().ok());
        Self {
            total_added: num("totalAdded"),
            total_completed: num("totalCompleted"),
            total_failed: num("totalFailed"),
            first_job_at: ts("firstJobAt"),
            last_job_at: ts("lastJobAt"),
            queues: queues.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_hash() {
        let hash: HashMap<String, String> = [
            ("totalAdded", "3"),
            ("totalCompleted", "2"),
            ("firstJobAt", "1700000000000"),
            ("lastJobAt", "garbage"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let meta = EntityJobMetadata::from_hash(&hash, vec!["analysis".to_string()]);
        assert_eq!(meta.total_added, 3);
        assert_eq!(meta.total_completed, 2);
        assert_eq!(meta.total_failed, 0);
        assert_eq!(meta.first_job_at, Some(1_700_000_000_000));
        assert_eq!(meta.last_job_at, None);
        assert!(meta.queues.contains("analysis"));
    }
}
