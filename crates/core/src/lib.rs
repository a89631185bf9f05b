// crates/core/src/lib.rs
//! Distributed job lifecycle tracking.
//!
//! Workers in any process report job starts and finishes to a [`JobManager`],
//! which keeps an atomic per-entity active counter in the shared coordination
//! store and cleans the entity up once its last job is done. The
//! [`LockManager`] serializes cleanups and bulk deletions across processes,
//! the [`JobScanner`] finds status records without blocking the store, and
//! [`JobStatusWriter`] / [`JobUpdatePublisher`] feed the realtime update
//! channel.

pub mod error;
pub mod lock;
pub mod manager;
pub mod publish;
pub mod scanner;
pub mod status;

pub use error::{CoreError, CoreResult};
pub use lock::{LockManager, LockOutcome};
pub use manager::{
    BulkDeleteResult, CleanupHandler, CleanupOutcome, DecrementResult, EntityZero, JobContext,
    JobManager, JobManagerConfig, RelatedArtifacts,
};
pub use publish::JobUpdatePublisher;
pub use scanner::{JobFilter, JobScanner, SCAN_BATCH, SNAPSHOT_BATCH};
pub use status::JobStatusWriter;
