// crates/types/src/lib.rs
//! Shared data model for background job tracking.
//!
//! Everything here is plain data: job status records as workers store them,
//! the normalized update shape clients receive, per-entity metadata, and the
//! key layout every process agrees on when talking to the coordination store.

pub mod job;
pub mod keys;
pub mod metadata;
pub mod update;

pub use job::{JobRecord, JobStatus, ACTIVE_STATUSES};
pub use keys::EntityKeys;
pub use metadata::{EntityJobMetadata, JobOutcome};
pub use update::{JobUpdate, UpdateEnvelope, JOB_UPDATES_CHANNEL};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current wall-clock time as an RFC 3339 string with millisecond precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
