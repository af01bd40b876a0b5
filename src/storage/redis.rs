//! Redis mirror backend.
//!
//! Records are stored as JSON envelopes with their write timestamp:
//! ```json
//! {"v": {"status": "cancelled", "subject": "exam:42"}, "ts": 1767084657058}
//! ```
//! Counters are plain Redis integers so `INCRBY` semantics stay native.
//! The floor-at-zero and raise-to-floor rules run server-side in Lua, which
//! keeps each counter update a single atomic step even with many writers.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{pipe, AsyncCommands, Client, Script};
use serde_json::Value;
use tracing::debug;

use super::traits::{now_ms, report_clamp, MirrorError, MirrorRecord, MirrorStore};
use crate::resilience::retry::{retry, RetryConfig};

/// INCRBY that never leaves a negative value behind. Returns {value, attempted}.
const INCR_CLAMPED_LUA: &str = r"
local attempted = redis.call('INCRBY', KEYS[1], ARGV[1])
local value = attempted
if attempted < 0 then
  redis.call('SET', KEYS[1], 0)
  value = 0
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
return {value, attempted}
";

/// Same as INCR_CLAMPED_LUA, but a missing counter stays missing (returns nil).
const INCR_EXISTING_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return nil
end
local attempted = redis.call('INCRBY', KEYS[1], ARGV[1])
local value = attempted
if attempted < 0 then
  redis.call('SET', KEYS[1], 0)
  value = 0
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
return {value, attempted}
";

/// Write ARGV[1] when the counter is missing or below it. Returns 1 when written.
const RAISE_TO_FLOOR_LUA: &str = r"
local current = redis.call('GET', KEYS[1])
if (not current) or (tonumber(current) < tonumber(ARGV[1])) then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
  return 1
end
return 0
";

const SCAN_COUNT: usize = 100;

pub struct RedisMirror {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "bookings:" → "bookings:item:b-1")
    prefix: String,
    /// Upper bound on `delete_pattern` so invalidation never stalls a request
    pattern_timeout: Duration,
    incr_script: Script,
    incr_existing_script: Script,
    floor_script: Script,
}

impl RedisMirror {
    pub async fn new(connection_string: &str) -> Result<Self, MirrorError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix prepended to every key.
    ///
    /// ```rust,no_run
    /// # use batch_sync_engine::storage::redis::RedisMirror;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let mirror = RedisMirror::with_prefix("redis://localhost", Some("bookings:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, MirrorError> {
        let client = Client::open(connection_string)
            .map_err(|e| MirrorError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| MirrorError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            pattern_timeout: Duration::from_millis(250),
            incr_script: Script::new(INCR_CLAMPED_LUA),
            incr_existing_script: Script::new(INCR_EXISTING_LUA),
            floor_script: Script::new(RAISE_TO_FLOOR_LUA),
        })
    }

    #[must_use]
    pub fn with_pattern_timeout(mut self, timeout: Duration) -> Self {
        self.pattern_timeout = timeout;
        self
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix).unwrap_or(key)
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }

    fn encode_record(value: &Value) -> Result<String, MirrorError> {
        let envelope = serde_json::json!({ "v": value, "ts": now_ms() });
        serde_json::to_string(&envelope).map_err(|e| MirrorError::Backend(e.to_string()))
    }

    /// Envelopes decode to their payload; bare values (counters) decode as-is.
    fn decode_record(key: &str, raw: &str) -> Result<MirrorRecord, MirrorError> {
        let doc: Value = serde_json::from_str(raw).map_err(|e| MirrorError::Decode {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        match doc {
            Value::Object(mut map) if map.contains_key("v") && map.contains_key("ts") => {
                let updated_at_ms = map.get("ts").and_then(Value::as_i64).unwrap_or(0);
                let value = map.remove("v").unwrap_or(Value::Null);
                Ok(MirrorRecord { value, updated_at_ms })
            }
            other => Ok(MirrorRecord { value: other, updated_at_ms: 0 }),
        }
    }

    /// Cursor-driven SCAN so Redis is never blocked by KEYS.
    async fn scan_keys(&self, pattern: &str, limit: Option<usize>) -> Result<Vec<String>, MirrorError> {
        let mut conn = self.connection.clone();
        let match_pattern = self.prefixed_key(pattern);
        let mut keys: Vec<String> = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&match_pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| MirrorError::Backend(format!("Failed to scan keys: {}", e)))?;

            keys.extend(batch);
            cursor = next;

            if cursor == 0 || limit.is_some_and(|l| keys.len() >= l) {
                break;
            }
        }

        if let Some(limit) = limit {
            keys.truncate(limit);
        }
        Ok(keys)
    }
}

#[async_trait]
impl MirrorStore for RedisMirror {
    async fn get_record(&self, key: &str) -> Result<Option<MirrorRecord>, MirrorError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let raw: Option<String> = retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let data: Option<String> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(|e: redis::RedisError| MirrorError::Backend(e.to_string()))?;

        raw.map(|s| Self::decode_record(key, &s)).transpose()
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), MirrorError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);
        let doc = Self::encode_record(value)?;
        let ttl = Self::ttl_secs(ttl);

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            let doc = doc.clone();
            async move {
                let _: () = conn.set_ex(&key, &doc, ttl).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| MirrorError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), MirrorError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let _: () = conn.del(&key).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| MirrorError::Backend(e.to_string()))
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, MirrorError> {
        let work = async {
            let keys = self.scan_keys(pattern, None).await?;
            if keys.is_empty() {
                return Ok(0);
            }

            let mut conn = self.connection.clone();
            let mut removed = 0u64;
            for chunk in keys.chunks(SCAN_COUNT) {
                let mut pipeline = pipe();
                for key in chunk {
                    pipeline.del(key);
                }
                let counts: Vec<u64> = pipeline
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| MirrorError::Backend(format!("Failed to delete keys: {}", e)))?;
                removed += counts.iter().sum::<u64>();
            }
            debug!(pattern = %pattern, removed, "Pattern purge complete");
            Ok(removed)
        };

        tokio::time::timeout(self.pattern_timeout, work)
            .await
            .map_err(|_| MirrorError::Timeout(self.pattern_timeout))?
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, MirrorError> {
        let mut conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let (value, attempted): (i64, i64) = self
            .incr_script
            .key(&prefixed)
            .arg(delta)
            .arg(Self::ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MirrorError::Backend(format!("INCRBY script failed: {}", e)))?;

        if attempted < 0 {
            report_clamp("redis", key, attempted);
        }
        Ok(value)
    }

    async fn incr_existing(&self, key: &str, delta: i64, ttl: Duration) -> Result<Option<i64>, MirrorError> {
        let mut conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let moved: Option<(i64, i64)> = self
            .incr_existing_script
            .key(&prefixed)
            .arg(delta)
            .arg(Self::ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MirrorError::Backend(format!("INCRBY-existing script failed: {}", e)))?;

        Ok(moved.map(|(value, attempted)| {
            if attempted < 0 {
                report_clamp("redis", key, attempted);
            }
            value
        }))
    }

    async fn set_if_absent_or_lower_floor(&self, key: &str, floor: i64, ttl: Duration) -> Result<bool, MirrorError> {
        let mut conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let written: i64 = self
            .floor_script
            .key(&prefixed)
            .arg(floor.max(0))
            .arg(Self::ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MirrorError::Backend(format!("Floor script failed: {}", e)))?;

        Ok(written == 1)
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>, MirrorError> {
        let mut conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let raw: Option<String> = conn
            .get(&prefixed)
            .await
            .map_err(|e| MirrorError::Backend(e.to_string()))?;

        raw.map(|s| {
            s.trim().parse::<i64>().map_err(|e| MirrorError::Decode {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
    }

    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<(), MirrorError> {
        let mut conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let _: () = conn
            .set_ex(&prefixed, value.max(0), Self::ttl_secs(ttl))
            .await
            .map_err(|e| MirrorError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn scan(&self, pattern: &str, limit: usize) -> Result<Vec<String>, MirrorError> {
        let keys = self.scan_keys(pattern, Some(limit)).await?;
        Ok(keys.iter().map(|k| self.strip_prefix(k).to_string()).collect())
    }
}
