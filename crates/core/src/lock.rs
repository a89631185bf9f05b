// crates/core/src/lock.rs
//! Best-effort mutual exclusion across processes.
//!
//! A lock is a store key written with SET NX plus an expiry. Release deletes
//! the key unconditionally, so a holder that outlives its TTL can free a lock
//! someone else has since taken. The TTLs used by the job manager are long
//! compared to the guarded work, which keeps that window small.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use jobpulse_store::SharedStore;
use jobpulse_types::now_millis;

use crate::error::CoreResult;

/// Result of [`LockManager::with_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    Acquired(T),
    /// Someone else holds the lock; the action did not run.
    Contended,
}

#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
}

impl LockManager {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Try once to take `key` for `ttl`. Never waits.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> CoreResult<bool> {
        let token = lock_token();
        let acquired = self.store.set_if_absent(key, &token, ttl).await?;
        if acquired {
            tracing::debug!(key, token = %token, "lock acquired");
        } else {
            tracing::debug!(key, "lock held elsewhere");
        }
        Ok(acquired)
    }

    pub async fn release(&self, key: &str) -> CoreResult<()> {
        self.store.delete(&[key.to_string()]).await?;
        tracing::debug!(key, "lock released");
        Ok(())
    }

    /// Run `action` while holding `key`.
    ///
    /// The lock is released after the action finishes, including when it
    /// panics (the panic is resumed afterwards). A failed release is logged
    /// and left to expire.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        action: F,
    ) -> CoreResult<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire(key, ttl).await? {
            return Ok(LockOutcome::Contended);
        }

        let result = AssertUnwindSafe(action()).catch_unwind().await;

        if let Err(e) = self.release(key).await {
            tracing::warn!(key, error = %e, "failed to release lock; it will expire");
        }

        match result {
            Ok(value) => Ok(LockOutcome::Acquired(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn lock_token() -> String {
    format!("{}:{}", std::process::id(), now_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobpulse_store::{CoordinationStore, MemoryStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn manager() -> (LockManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (LockManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_release() {
        let (locks, _) = manager();
        let ttl = Duration::from_secs(60);

        assert!(locks.acquire("e:cleanup:lock", ttl).await.unwrap());
        assert!(!locks.acquire("e:cleanup:lock", ttl).await.unwrap());
        locks.release("e:cleanup:lock").await.unwrap();
        assert!(locks.acquire("e:cleanup:lock", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_after_ttl() {
        let (locks, _) = manager();

        assert!(locks.acquire("k", Duration::from_secs(60)).await.unwrap());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(locks.acquire("k", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_token_is_pid_and_millis() {
        let (locks, store) = manager();
        locks.acquire("k", Duration::from_secs(5)).await.unwrap();

        let token = store.get("k").await.unwrap().unwrap();
        let (pid, ms) = token.split_once(':').unwrap();
        assert_eq!(pid, std::process::id().to_string());
        assert!(ms.parse::<i64>().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_with_lock_contended_skips_action() {
        let (locks, _) = manager();
        locks.acquire("k", Duration::from_secs(60)).await.unwrap();

        let ran = AtomicBool::new(false);
        let flag = &ran;
        let outcome = locks
            .with_lock("k", Duration::from_secs(60), move || async move {
                flag.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(outcome, LockOutcome::Contended);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_action() {
        let (locks, store) = manager();

        let outcome = locks
            .with_lock("k", Duration::from_secs(60), || async { 7 })
            .await
            .unwrap();

        assert_eq!(outcome, LockOutcome::Acquired(7));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_with_lock_releases_when_action_panics() {
        let (locks, store) = manager();

        let task_locks = locks.clone();
        let joined = tokio::spawn(async move {
            task_locks
                .with_lock("k", Duration::from_secs(60), || async {
                    panic!("boom");
                })
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(locks.acquire("k", Duration::from_secs(60)).await.unwrap());
    }
}
