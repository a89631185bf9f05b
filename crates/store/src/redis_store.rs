// crates/store/src/redis_store.rs
//! Redis-backed coordination store.
//!
//! Plain commands go through a shared `ConnectionManager` (reconnects on its
//! own); pub/sub gets a dedicated connection per subscription because a
//! subscribed Redis connection cannot issue regular commands.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use jobpulse_types::{EntityKeys, JobOutcome};
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use crate::error::{StoreError, StoreResult};
use crate::{CoordinationStore, MessageStream, ScanPage};

/// KEYS: active, metadata, queues. ARGV: queueType, nowMs, ttlSeconds.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[3])
redis.call('HINCRBY', KEYS[2], 'totalAdded', 1)
redis.call('HSET', KEYS[2], 'lastJobAt', ARGV[2])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('EXPIRE', KEYS[2], ARGV[3])
redis.call('EXPIRE', KEYS[3], ARGV[3])
if count == 1 then
  redis.call('HSETNX', KEYS[2], 'firstJobAt', ARGV[2])
end
return count
"#;

/// KEYS: active, metadata. ARGV: outcome counter field, nowMs.
const DECREMENT_SCRIPT: &str = r#"
local remaining = redis.call('DECR', KEYS[1])
redis.call('HINCRBY', KEYS[2], ARGV[1], 1)
redis.call('HSET', KEYS[2], 'lastJobAt', ARGV[2])
return remaining
"#;

/// KEYS: key. ARGV: expected, value, ttlMillis, expectPresent ('1' or '0').
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[4] == '1' then
  if current ~= ARGV[1] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    increment: Script,
    decrement: Script,
    compare_and_set: Script,
}

impl RedisStore {
    /// Open a client for `url` (e.g. `redis://127.0.0.1:6379`) and establish
    /// the shared command connection.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!(url = %url, "connected to redis");
        Ok(Self {
            client,
            conn,
            increment: Script::new(INCREMENT_SCRIPT),
            decrement: Script::new(DECREMENT_SCRIPT),
            compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("GET").arg(key);
        }
        let values: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .compare_and_set
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl_millis(ttl))
            .arg(if expected.is_some() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(hash)
    }

    async fn scan_match(&self, cursor: u64, pattern: &str, count: usize) -> StoreResult<ScanPage> {
        let mut conn = self.conn.clone();
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(ScanPage { cursor, keys })
    }

    async fn increment_active(
        &self,
        keys: &EntityKeys,
        queue_type: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .increment
            .key(&keys.active)
            .key(&keys.metadata)
            .key(&keys.queues)
            .arg(queue_type)
            .arg(now_ms)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn decrement_active(
        &self,
        keys: &EntityKeys,
        outcome: JobOutcome,
        now_ms: i64,
    ) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let remaining: i64 = self
            .decrement
            .key(&keys.active)
            .key(&keys.metadata)
            .arg(outcome.counter_field())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(remaining)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Subscribe {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;
        pubsub.subscribe(channel).await?;

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let decoded = msg.get_payload::<String>();
            if let Err(e) = &decoded {
                tracing::warn!(channel = %channel, error = %e, "dropping non-text pub/sub payload");
            }
            futures_util::future::ready(decoded.ok())
        });

        Ok(Box::pin(stream))
    }
}
