// crates/store/src/error.rs
use thiserror::Error;

/// Failures talking to the coordination store.
///
/// Callers treat every variant as "store unavailable": nothing at this layer
/// retries.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Wrong value type at key {key}")]
    WrongType { key: String },

    #[error("Value at key {key} is not an integer")]
    NotInteger { key: String },

    #[error("Subscription to {channel} failed: {message}")]
    Subscribe { channel: String, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;
