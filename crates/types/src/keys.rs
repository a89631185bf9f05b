// crates/types/src/keys.rs
//! Key layout shared by every process that touches the coordination store.
//!
//! Queue workers, the job manager and the fanout relay all compute these
//! independently, so the formats are fixed:
//!
//! | Key | Holds |
//! |-----|-------|
//! | `{queue}_queue:status:{jobId}` | serialized `JobRecord` |
//! | `job:retries:{jobId}` | retry counter |
//! | `team:{teamId}:jobs` | set of job ids known for a team |
//! | `{prefix}:{entityId}:jobs:active` | active-job counter |
//! | `{prefix}:{entityId}:jobs:metadata` | metadata hash |
//! | `{prefix}:{entityId}:jobs:metadata:queues` | set of queue types seen |
//! | `{prefix}:{entityId}:cleanup:lock` | cleanup / history lock token |

pub fn status_key(queue: &str, job_id: &str) -> String {
    format!("{queue}_queue:status:{job_id}")
}

pub fn status_pattern(queue: &str) -> String {
    format!("{queue}_queue:status:*")
}

pub fn retry_key(job_id: &str) -> String {
    format!("job:retries:{job_id}")
}

pub fn team_jobs_key(team_id: &str) -> String {
    format!("team:{team_id}:jobs")
}

pub fn active_counter_pattern(prefix: &str) -> String {
    format!("{prefix}:*:jobs:active")
}

/// Extract the entity id from an active-counter key, if it has that shape.
pub fn entity_from_active_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let id = key
        .strip_prefix(prefix)?
        .strip_prefix(':')?
        .strip_suffix(":jobs:active")?;
    (!id.is_empty() && !id.contains(':')).then_some(id)
}

/// The per-entity keys owned by a job manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKeys {
    pub active: String,
    pub metadata: String,
    pub queues: String,
    pub lock: String,
}

impl EntityKeys {
    pub fn new(prefix: &str, entity_id: &str) -> Self {
        let base = format!("{prefix}:{entity_id}");
        Self {
            active: format!("{base}:jobs:active"),
            metadata: format!("{base}:jobs:metadata"),
            queues: format!("{base}:jobs:metadata:queues"),
            lock: format!("{base}:cleanup:lock"),
        }
    }

    /// Counter and metadata keys, i.e. everything a cleanup clears.
    pub fn bookkeeping(&self) -> [String; 3] {
        [
            self.active.clone(),
            self.metadata.clone(),
            self.queues.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_keys_layout() {
        let keys = EntityKeys::new("trajectory", "traj-1");
        assert_eq!(keys.active, "trajectory:traj-1:jobs:active");
        assert_eq!(keys.metadata, "trajectory:traj-1:jobs:metadata");
        assert_eq!(keys.queues, "trajectory:traj-1:jobs:metadata:queues");
        assert_eq!(keys.lock, "trajectory:traj-1:cleanup:lock");
    }

    #[test]
    fn test_entity_from_active_key() {
        assert_eq!(
            entity_from_active_key("trajectory", "trajectory:traj-1:jobs:active"),
            Some("traj-1")
        );
        assert_eq!(entity_from_active_key("trajectory", "trajectory:a:b:jobs:active"), None);
        assert_eq!(entity_from_active_key("trajectory", "analysis:x:jobs:active"), None);
        assert_eq!(entity_from_active_key("trajectory", "trajectory::jobs:active"), None);
    }

    #[test]
    fn test_queue_keys() {
        assert_eq!(status_key("analysis", "j1"), "analysis_queue:status:j1");
        assert_eq!(status_pattern("analysis"), "analysis_queue:status:*");
        assert_eq!(retry_key("j1"), "job:retries:j1");
        assert_eq!(team_jobs_key("t1"), "team:t1:jobs");
    }
}
