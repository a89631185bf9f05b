// crates/core/src/error.rs
use jobpulse_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the lock manager, scanner and job manager.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Coordination store unavailable: {0}")]
    Store(#[from] StoreError),

    /// Another operation holds the entity's lock. Callers may retry later.
    #[error("Another operation is in progress for {entity_id}; try again later")]
    LockConflict { entity_id: String },

    #[error("Cleanup hook failed for {entity_id}: {source}")]
    CleanupFailed {
        entity_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Deleting related artifacts failed for {entity_id}: {source}")]
    RelatedCleanupFailed {
        entity_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether retrying the same call later can succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::LockConflict { .. })
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
