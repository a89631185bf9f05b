// crates/store/src/lib.rs
//! Coordination store seam.
//!
//! Every server instance and worker shares one key-value store. This crate
//! defines the operations the job tracker needs from it as a trait, with two
//! backends:
//!
//! - [`RedisStore`]: production backend; compound counter updates run as
//!   Lua scripts so they are atomic across processes.
//! - [`MemoryStore`]: in-process backend with the same semantics, used by
//!   tests and single-node deployments.

pub mod error;
pub mod memory;
pub mod redis_store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use jobpulse_types::{EntityKeys, JobOutcome};

/// Messages received on a subscribed pub/sub channel.
pub type MessageStream = BoxStream<'static, String>;

/// Shared handle used throughout the workspace.
pub type SharedStore = Arc<dyn CoordinationStore>;

/// One page of a cursor-based key scan. A returned cursor of 0 ends the scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Pipelined GET; results line up with `keys`.
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// SET NX with expiry. Returns whether the key was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Write `value` with expiry only if the key still holds `expected`
    /// (`None` meaning absent). Returns whether the key was written.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Non-blocking incremental key enumeration, `count` keys examined per call.
    /// A key that exists for the whole scan is returned at least once.
    async fn scan_match(&self, cursor: u64, pattern: &str, count: usize) -> StoreResult<ScanPage>;

    /// Atomically: bump the active counter (refreshing its TTL), bump
    /// `totalAdded`, stamp `lastJobAt`, record the queue type, refresh the
    /// metadata TTLs and, when the counter lands on 1, set `firstJobAt` if
    /// unset. Returns the post-increment count.
    async fn increment_active(
        &self,
        keys: &EntityKeys,
        queue_type: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> StoreResult<i64>;

    /// Atomically: decrement the active counter, bump `totalCompleted` or
    /// `totalFailed`, stamp `lastJobAt`. Returns the post-decrement count,
    /// which may be negative.
    async fn decrement_active(
        &self,
        keys: &EntityKeys,
        outcome: JobOutcome,
        now_ms: i64,
    ) -> StoreResult<i64>;

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream>;
}
