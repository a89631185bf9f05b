// crates/store/src/memory.rs
//! In-process coordination store.
//!
//! Mirrors the Redis semantics the tracker relies on: lazy key expiry,
//! SET NX, cursor scans with glob patterns, and the two counter scripts,
//! which run under a single mutex so they are atomic with respect to every
//! other operation on the same store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use jobpulse_types::{EntityKeys, JobOutcome};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{StoreError, StoreResult};
use crate::{CoordinationStore, MessageStream, ScanPage};

/// Buffered messages per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 1024;

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Keyspace {
    entries: BTreeMap<String, Entry>,
    /// Open scan cursors, each mapped to the last key it returned. Resuming
    /// after a key rather than at an offset keeps keys that live through the
    /// whole scan from being skipped when earlier keys disappear.
    scans: HashMap<u64, String>,
    next_scan: u64,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

fn parse_int(key: &str, raw: &str) -> StoreResult<i64> {
    raw.parse::<i64>().map_err(|_| StoreError::NotInteger {
        key: key.to_string(),
    })
}

impl Keyspace {
    fn purge_expired(&mut self, key: &str) {
        let now = Instant::now();
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
    }

    fn purge_all_expired(&mut self) {
        let now = Instant::now();
        self.entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
    }

    fn string(&mut self, key: &str) -> StoreResult<Option<String>> {
        self.purge_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_string(&mut self, key: &str, value: String, expires_at: Option<Instant>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at,
            },
        );
    }

    /// INCRBY: creates the key at 0 first, keeps any existing TTL.
    fn incr_by(&mut self, key: &str, delta: i64) -> StoreResult<i64> {
        let current = match self.string(key)? {
            Some(raw) => parse_int(key, &raw)?,
            None => 0,
        };
        let next = current + delta;
        match self.entries.get_mut(key) {
            Some(entry) => entry.value = Value::Str(next.to_string()),
            None => self.set_string(key, next.to_string(), None),
        }
        Ok(next)
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        self.purge_expired(key);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn hash_incr_by(&mut self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let hash = self.hash_mut(key)?;
        let current = match hash.get(field) {
            Some(raw) => parse_int(key, raw)?,
            None => 0,
        };
        hash.insert(field.to_string(), (current + delta).to_string());
        Ok(current + delta)
    }

    fn set_mut(&mut self, key: &str) -> StoreResult<&mut BTreeSet<String>> {
        self.purge_expired(key);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type(key)),
        }
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        self.purge_expired(key);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }
}

/// Single-process [`CoordinationStore`].
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.keyspace().string(key)
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let mut ks = self.keyspace();
        // A pipelined GET against a non-string key yields a per-item error,
        // which readers treat the same as a missing value.
        Ok(keys
            .iter()
            .map(|k| ks.string(k).ok().flatten())
            .collect())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.keyspace()
            .set_string(key, value.to_string(), Some(Instant::now() + ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut ks = self.keyspace();
        ks.purge_expired(key);
        if ks.entries.contains_key(key) {
            return Ok(false);
        }
        ks.set_string(key, value.to_string(), Some(Instant::now() + ttl));
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut ks = self.keyspace();
        if ks.string(key)?.as_deref() != expected {
            return Ok(false);
        }
        ks.set_string(key, value.to_string(), Some(Instant::now() + ttl));
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let mut ks = self.keyspace();
        let mut removed = 0;
        for key in keys {
            ks.purge_expired(key);
            if ks.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        self.keyspace().set_mut(key)?.insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut ks = self.keyspace();
        ks.purge_expired(key);
        let now_empty = match ks.entries.get_mut(key) {
            None => return Ok(()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.remove(member);
                set.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            ks.entries.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut ks = self.keyspace();
        ks.purge_expired(key);
        match ks.entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut ks = self.keyspace();
        ks.purge_expired(key);
        match ks.entries.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scan_match(&self, cursor: u64, pattern: &str, count: usize) -> StoreResult<ScanPage> {
        let mut ks = self.keyspace();
        ks.purge_all_expired();

        let after = if cursor == 0 {
            None
        } else {
            match ks.scans.remove(&cursor) {
                Some(last) => Some(last),
                // Unknown or finished cursor: nothing left to walk.
                None => return Ok(ScanPage::default()),
            }
        };

        let count = count.max(1);
        let (keys, last, more) = {
            let mut walked: Vec<&String> = match &after {
                Some(last) => ks
                    .entries
                    .range::<str, _>((Bound::Excluded(last.as_str()), Bound::Unbounded))
                    .map(|(k, _)| k)
                    .take(count + 1)
                    .collect(),
                None => ks.entries.keys().take(count + 1).collect(),
            };
            let more = walked.len() > count;
            walked.truncate(count);
            let keys: Vec<String> = walked
                .iter()
                .filter(|k| glob_match(pattern.as_bytes(), k.as_bytes()))
                .map(|k| (*k).clone())
                .collect();
            (keys, walked.last().map(|k| (*k).clone()), more)
        };

        let cursor = match last {
            Some(last) if more => {
                ks.next_scan = ks.next_scan.wrapping_add(1).max(1);
                let id = ks.next_scan;
                ks.scans.insert(id, last);
                id
            }
            _ => 0,
        };
        Ok(ScanPage { cursor, keys })
    }

    async fn increment_active(
        &self,
        keys: &EntityKeys,
        queue_type: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> StoreResult<i64> {
        let mut ks = self.keyspace();
        let now = now_ms.to_string();

        let count = ks.incr_by(&keys.active, 1)?;
        ks.expire(&keys.active, ttl);

        ks.hash_incr_by(&keys.metadata, "totalAdded", 1)?;
        let meta = ks.hash_mut(&keys.metadata)?;
        meta.insert("lastJobAt".to_string(), now.clone());
        if count == 1 {
            meta.entry("firstJobAt".to_string()).or_insert(now);
        }
        ks.set_mut(&keys.queues)?.insert(queue_type.to_string());
        ks.expire(&keys.metadata, ttl);
        ks.expire(&keys.queues, ttl);

        Ok(count)
    }

    async fn decrement_active(
        &self,
        keys: &EntityKeys,
        outcome: JobOutcome,
        now_ms: i64,
    ) -> StoreResult<i64> {
        let mut ks = self.keyspace();

        let remaining = ks.incr_by(&keys.active, -1)?;
        ks.hash_incr_by(&keys.metadata, outcome.counter_field(), 1)?;
        ks.hash_mut(&keys.metadata)?
            .insert("lastJobAt".to_string(), now_ms.to_string());

        Ok(remaining)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        // No receivers is fine: pub/sub does not retain messages.
        let _ = self.sender(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) => return Some((msg, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %channel, skipped, "subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Redis-style glob match supporting `*` and `?`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"analysis_queue:status:*", b"analysis_queue:status:j1"));
        assert!(glob_match(b"trajectory:*:jobs:active", b"trajectory:t-1:jobs:active"));
        assert!(glob_match(b"a?c", b"abc"));
        assert!(!glob_match(b"analysis_queue:status:*", b"raster_queue:status:j1"));
        assert!(!glob_match(b"a?c", b"abbc"));
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_expiry() {
        tokio::time::pause();
        let store = MemoryStore::new();

        assert!(store.set_if_absent("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.set_if_absent("lock", "c", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.compare_and_set("c", None, "3", ttl).await.unwrap());
        assert!(!store.compare_and_set("c", None, "4", ttl).await.unwrap());
        assert!(!store.compare_and_set("c", Some("2"), "4", ttl).await.unwrap());
        assert!(store.compare_and_set("c", Some("3"), "4", ttl).await.unwrap());
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_counter_scripts() {
        let store = MemoryStore::new();
        let keys = EntityKeys::new("trajectory", "traj-1");
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment_active(&keys, "analysis", 100, ttl).await.unwrap(), 1);
        assert_eq!(store.increment_active(&keys, "raster", 200, ttl).await.unwrap(), 2);
        assert_eq!(
            store.decrement_active(&keys, JobOutcome::Completed, 300).await.unwrap(),
            1
        );

        let meta = store.hash_get_all(&keys.metadata).await.unwrap();
        assert_eq!(meta.get("totalAdded").map(String::as_str), Some("2"));
        assert_eq!(meta.get("totalCompleted").map(String::as_str), Some("1"));
        assert_eq!(meta.get("firstJobAt").map(String::as_str), Some("100"));
        assert_eq!(meta.get("lastJobAt").map(String::as_str), Some("300"));
        assert_eq!(
            store.set_members(&keys.queues).await.unwrap(),
            vec!["analysis".to_string(), "raster".to_string()]
        );
    }

    #[tokio::test]
    async fn test_decrement_on_missing_counter_goes_negative() {
        let store = MemoryStore::new();
        let keys = EntityKeys::new("trajectory", "ghost");
        assert_eq!(
            store.decrement_active(&keys, JobOutcome::Failed, 1).await.unwrap(),
            -1
        );
    }

    #[tokio::test]
    async fn test_scan_pages_through_all_matches() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .set_with_ttl(&format!("analysis_queue:status:j{i}"), "{}", Duration::from_secs(60))
                .await
                .unwrap();
        }
        store
            .set_with_ttl("unrelated", "x", Duration::from_secs(60))
            .await
            .unwrap();

        let mut cursor = 0;
        let mut found = Vec::new();
        loop {
            let page = store
                .scan_match(cursor, "analysis_queue:status:*", 10)
                .await
                .unwrap();
            found.extend(page.keys);
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(found.len(), 25);
    }

    #[tokio::test]
    async fn test_scan_returns_keys_that_outlive_earlier_deletes() {
        let store = MemoryStore::new();
        let keys: Vec<String> = (0..20)
            .map(|i| format!("analysis_queue:status:j{i:02}"))
            .collect();
        for key in &keys {
            store
                .set_with_ttl(key, "{}", Duration::from_secs(60))
                .await
                .unwrap();
        }

        let first = store
            .scan_match(0, "analysis_queue:status:*", 10)
            .await
            .unwrap();
        assert_ne!(first.cursor, 0);
        store.delete(&keys[..1]).await.unwrap();

        let mut found = first.keys;
        let mut cursor = first.cursor;
        while cursor != 0 {
            let page = store
                .scan_match(cursor, "analysis_queue:status:*", 10)
                .await
                .unwrap();
            found.extend(page.keys);
            cursor = page.cursor;
        }

        for key in &keys[1..] {
            assert!(found.contains(key), "{key} was skipped");
        }
    }

    #[tokio::test]
    async fn test_scan_survives_expiry_between_pages() {
        tokio::time::pause();
        let store = MemoryStore::new();
        store
            .set_with_ttl("a:short", "x", Duration::from_secs(1))
            .await
            .unwrap();
        for i in 0..5 {
            store
                .set_with_ttl(&format!("b:{i}"), "x", Duration::from_secs(60))
                .await
                .unwrap();
        }

        let first = store.scan_match(0, "b:*", 3).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let second = store.scan_match(first.cursor, "b:*", 3).await.unwrap();

        let mut found = first.keys;
        found.extend(second.keys);
        assert_eq!(second.cursor, 0);
        assert_eq!(found, vec!["b:0", "b:1", "b:2", "b:3", "b:4"]);
    }

    #[tokio::test]
    async fn test_scan_with_unknown_cursor_ends() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.scan_match(42, "*", 10).await.unwrap(), ScanPage::default());
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.set_add("team:t1:jobs", "j1").await.unwrap();
        assert!(matches!(
            store.get("team:t1:jobs").await,
            Err(StoreError::WrongType { .. })
        ));
    }

    #[tokio::test]
    async fn test_pubsub_delivers_to_every_subscriber() {
        let store = MemoryStore::new();
        let mut a = store.subscribe("job_updates").await.unwrap();
        let mut b = store.subscribe("job_updates").await.unwrap();

        store.publish("job_updates", "hello").await.unwrap();
        store.publish("other", "ignored").await.unwrap();

        assert_eq!(a.next().await.as_deref(), Some("hello"));
        assert_eq!(b.next().await.as_deref(), Some("hello"));
    }
}
