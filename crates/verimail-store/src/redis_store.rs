//! Redis key-value store
//!
//! Shares one multiplexed connection across callers and reconnects lazily
//! after the connection drops. The atomic primitives run as Lua scripts so
//! the read and the write happen in a single Redis command.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, RedisError, Script};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::{KeyValueStore, StoreError};

/// Swap the value if it matches, keeping the TTL.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
        return 1
    end
    return 0
"#;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// INCR + PEXPIRE on first increment only. Running both in one script means
/// a counter can never be left without a TTL.
const INCREMENT_SCRIPT: &str = r#"
    local count = redis.call('INCR', KEYS[1])
    if count == 1 then
        redis.call('PEXPIRE', KEYS[1], ARGV[1])
    end
    return count
"#;

/// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 200;

/// Redis-backed store
pub struct RedisStore {
    /// Redis client
    client: Client,
    /// Shared connection, `None` after a dropped connection
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Connection(format!("Invalid Redis URL: {}", e)))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(Some(connection))),
        })
    }

    /// Get a connection, reconnecting if needed
    async fn get_connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let guard = self.connection.read().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        drop(guard);

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to reconnect to Redis: {}", e)))?;

        debug!("Reconnected to Redis");
        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Map a Redis error, dropping the cached connection if it is dead
    async fn map_error(&self, op: &str, err: RedisError) -> StoreError {
        if err.is_connection_dropped() || err.is_io_error() || err.is_connection_refusal() {
            warn!(op, error = %err, "Redis connection lost");
            *self.connection.write().await = None;
            StoreError::Connection(format!("{} failed: {}", op, err))
        } else {
            StoreError::Command(format!("{} failed: {}", op, err))
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.get_connection().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.map_error("GET", e).await),
        }
    }

    #[instrument(skip(self, value))]
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.map_error("SET", e).await),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.get_connection().await?;
        match conn.del::<_, i64>(key).await {
            Ok(removed) => Ok(removed > 0),
            Err(e) => Err(self.map_error("DEL", e).await),
        }
    }

    #[instrument(skip(self, expected, new))]
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.get_connection().await?;
        let script = Script::new(COMPARE_AND_SWAP_SCRIPT);
        let result: redis::RedisResult<i64> = script
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(swapped) => Ok(swapped == 1),
            Err(e) => Err(self.map_error("CAS", e).await),
        }
    }

    #[instrument(skip(self, expected))]
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.get_connection().await?;
        let script = Script::new(COMPARE_AND_DELETE_SCRIPT);
        let result: redis::RedisResult<i64> =
            script.key(key).arg(expected).invoke_async(&mut conn).await;
        match result {
            Ok(removed) => Ok(removed == 1),
            Err(e) => Err(self.map_error("CAD", e).await),
        }
    }

    #[instrument(skip(self))]
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.get_connection().await?;
        let script = Script::new(INCREMENT_SCRIPT);
        let result: redis::RedisResult<u64> =
            script.key(key).arg(millis(ttl)).invoke_async(&mut conn).await;
        match result {
            Ok(count) => Ok(count),
            Err(e) => Err(self.map_error("INCR", e).await),
        }
    }

    #[instrument(skip(self))]
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<i64> =
            redis::cmd("PTTL").arg(key).query_async(&mut conn).await;
        match result {
            // -2: missing key, -1: no expiry
            Ok(ms) if ms >= 0 => Ok(Some(Duration::from_millis(ms as u64))),
            Ok(_) => Ok(None),
            Err(e) => Err(self.map_error("PTTL", e).await),
        }
    }

    #[instrument(skip(self))]
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.get_connection().await?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let result: redis::RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await;
            let (next, batch) = match result {
                Ok(page) => page,
                Err(e) => return Err(self.map_error("SCAN", e).await),
            };
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        debug!(prefix, count = keys.len(), "Scanned keys");
        Ok(keys)
    }
}
