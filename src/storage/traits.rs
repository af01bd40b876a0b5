use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Mirror backend error: {0}")]
    Backend(String),
    #[error("Mirror operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Mirror decode error for '{key}': {message}")]
    Decode { key: String, message: String },
    #[error("Invalid key pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
}

/// A cached record with its write timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRecord {
    pub value: Value,
    /// Epoch millis of the last write
    pub updated_at_ms: i64,
}

/// Local key/value mirror of SoR state: cached records plus integer counters.
///
/// Every method is atomic for its single key. Expired entries are always
/// reported absent. Counters never go below zero: a decrement that would
/// cross zero stores 0, refreshes the TTL and logs the clamp.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn get_record(&self, key: &str) -> Result<Option<MirrorRecord>, MirrorError>;
    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), MirrorError>;
    async fn delete(&self, key: &str) -> Result<(), MirrorError>;

    /// Delete every key matching a glob (`*`, `?`). Zero matches is a no-op.
    /// Returns the number of keys removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, MirrorError>;

    /// Add `delta` to a counter (absent counts as 0) and refresh its TTL.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, MirrorError>;

    /// [`incr_by`](Self::incr_by) on a live counter only. An absent or
    /// expired counter is left untouched and reported as `None`, in the same
    /// atomic step as the update.
    async fn incr_existing(&self, key: &str, delta: i64, ttl: Duration) -> Result<Option<i64>, MirrorError>;

    /// Store `floor` if the counter is absent or currently below it.
    /// Returns true when the value was written.
    async fn set_if_absent_or_lower_floor(&self, key: &str, floor: i64, ttl: Duration) -> Result<bool, MirrorError>;

    async fn get_counter(&self, key: &str) -> Result<Option<i64>, MirrorError>;

    /// Unconditional counter overwrite (drift correction). Negative values store 0.
    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<(), MirrorError>;

    /// Up to `limit` live keys matching a glob, in backend order.
    async fn scan(&self, pattern: &str, limit: usize) -> Result<Vec<String>, MirrorError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, MirrorError> {
        Ok(self.get_record(key).await?.map(|r| r.value))
    }
}

/// Log and count a counter clamp. A clamp means the mirror drifted below the SoR.
pub(crate) fn report_clamp(backend: &str, key: &str, attempted: i64) {
    warn!(
        backend = backend,
        key = %key,
        attempted = attempted,
        clamped_to = 0,
        "Counter decrement would go negative; clamped to zero (mirror drift)"
    );
    crate::metrics::record_counter_clamp(backend);
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
