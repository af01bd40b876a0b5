//! Configuration for the batch sync engine.
//!
//! # Example
//!
//! ```
//! use batch_sync_engine::EngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.max_batch_size, 100);
//! assert_eq!(config.sor_concurrency, 5);
//!
//! // Tuned config
//! let config = EngineConfig {
//!     sor_base_url: Some("https://crm.internal/api".into()),
//!     notifier_url: Some("https://hooks.internal/counts".into()),
//!     sor_chunk_size: 50,
//!     ..Default::default()
//! };
//! assert_eq!(config.sor_chunk_size, 50);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::resilience::retry::RetryConfig;

/// Configuration for the batch sync engine.
///
/// All fields have sensible defaults. Production hosts normally set
/// `sor_base_url`, `redis_url` and `notifier_url`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Largest accepted `MutationRequest` (requests above this are rejected, not chunked)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// System of record base URL (e.g., "https://crm.internal/api")
    #[serde(default)]
    pub sor_base_url: Option<String>,

    /// Provider max items per batch call
    #[serde(default = "default_sor_chunk_size")]
    pub sor_chunk_size: usize,

    /// Max concurrent chunk calls against the SoR
    #[serde(default = "default_sor_concurrency")]
    pub sor_concurrency: usize,

    /// Per-call HTTP timeout against the SoR
    #[serde(default = "default_sor_timeout_ms")]
    pub sor_timeout_ms: u64,

    /// Rate-limit / transport retry policy for a single chunk
    #[serde(default = "default_rate_limit_max_attempts")]
    pub rate_limit_max_attempts: usize,
    #[serde(default = "default_rate_limit_base_delay_ms")]
    pub rate_limit_base_delay_ms: u64,
    #[serde(default = "default_rate_limit_max_delay_ms")]
    pub rate_limit_max_delay_ms: u64,

    /// Redis connection string for the mirror (None = in-memory mirror)
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Key prefix for namespacing a shared Redis (e.g., "bookings:")
    #[serde(default)]
    pub redis_prefix: Option<String>,

    /// TTL for mirrored SoR records
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,

    /// TTL for records that only exist in the mirror
    #[serde(default = "default_local_record_ttl_secs")]
    pub local_record_ttl_secs: u64,

    /// TTL refreshed on every counter write
    #[serde(default = "default_counter_ttl_secs")]
    pub counter_ttl_secs: u64,

    /// Invalidation sets up to this many patterns are purged before responding
    #[serde(default = "default_invalidation_sync_threshold")]
    pub invalidation_sync_threshold: usize,

    /// Upper bound on a single pattern purge
    #[serde(default = "default_invalidation_timeout_ms")]
    pub invalidation_timeout_ms: u64,

    /// Downstream webhook receiving `{subjectId, count, timestamp}`
    #[serde(default)]
    pub notifier_url: Option<String>,

    /// Notifier retry settings (attempts at 0s, 2s, 6s by default)
    #[serde(default = "default_notifier_max_attempts")]
    pub notifier_max_attempts: usize,
    #[serde(default = "default_notifier_base_delay_ms")]
    pub notifier_base_delay_ms: u64,
    #[serde(default = "default_notifier_timeout_ms")]
    pub notifier_timeout_ms: u64,

    /// Max detached tasks (notifications, async purges) in flight
    #[serde(default = "default_background_task_limit")]
    pub background_task_limit: usize,

    /// Reconciliation sweeper defaults
    #[serde(default = "default_sweep_sample_size")]
    pub sweep_sample_size: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_batch_size() -> usize { 100 }
fn default_sor_chunk_size() -> usize { 100 }
fn default_sor_concurrency() -> usize { 5 }
fn default_sor_timeout_ms() -> u64 { 10_000 }
fn default_rate_limit_max_attempts() -> usize { 4 }
fn default_rate_limit_base_delay_ms() -> u64 { 500 }
fn default_rate_limit_max_delay_ms() -> u64 { 8_000 }
fn default_record_ttl_secs() -> u64 { 300 }
fn default_local_record_ttl_secs() -> u64 { 86_400 }
fn default_counter_ttl_secs() -> u64 { 3_600 }
fn default_invalidation_sync_threshold() -> usize { 16 }
fn default_invalidation_timeout_ms() -> u64 { 250 }
fn default_notifier_max_attempts() -> usize { 3 }
fn default_notifier_base_delay_ms() -> u64 { 2_000 }
fn default_notifier_timeout_ms() -> u64 { 5_000 }
fn default_background_task_limit() -> usize { 64 }
fn default_sweep_sample_size() -> usize { 50 }
fn default_sweep_interval_secs() -> u64 { 300 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            sor_base_url: None,
            sor_chunk_size: default_sor_chunk_size(),
            sor_concurrency: default_sor_concurrency(),
            sor_timeout_ms: default_sor_timeout_ms(),
            rate_limit_max_attempts: default_rate_limit_max_attempts(),
            rate_limit_base_delay_ms: default_rate_limit_base_delay_ms(),
            rate_limit_max_delay_ms: default_rate_limit_max_delay_ms(),
            redis_url: None,
            redis_prefix: None,
            record_ttl_secs: default_record_ttl_secs(),
            local_record_ttl_secs: default_local_record_ttl_secs(),
            counter_ttl_secs: default_counter_ttl_secs(),
            invalidation_sync_threshold: default_invalidation_sync_threshold(),
            invalidation_timeout_ms: default_invalidation_timeout_ms(),
            notifier_url: None,
            notifier_max_attempts: default_notifier_max_attempts(),
            notifier_base_delay_ms: default_notifier_base_delay_ms(),
            notifier_timeout_ms: default_notifier_timeout_ms(),
            background_task_limit: default_background_task_limit(),
            sweep_sample_size: default_sweep_sample_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn sor_timeout(&self) -> Duration {
        Duration::from_millis(self.sor_timeout_ms)
    }

    #[must_use]
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }

    #[must_use]
    pub fn local_record_ttl(&self) -> Duration {
        Duration::from_secs(self.local_record_ttl_secs)
    }

    #[must_use]
    pub fn counter_ttl(&self) -> Duration {
        Duration::from_secs(self.counter_ttl_secs)
    }

    #[must_use]
    pub fn invalidation_timeout(&self) -> Duration {
        Duration::from_millis(self.invalidation_timeout_ms)
    }

    #[must_use]
    pub fn notifier_timeout(&self) -> Duration {
        Duration::from_millis(self.notifier_timeout_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Per-chunk retry policy for 429s and transport failures.
    #[must_use]
    pub fn chunk_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: Some(self.rate_limit_max_attempts.max(1)),
            initial_delay: Duration::from_millis(self.rate_limit_base_delay_ms),
            max_delay: Duration::from_millis(self.rate_limit_max_delay_ms),
            factor: 2.0,
        }
    }

    /// Notifier retry policy. With the defaults the attempts land at 0s, 2s, 6s.
    #[must_use]
    pub fn notifier_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: Some(self.notifier_max_attempts.max(1)),
            initial_delay: Duration::from_millis(self.notifier_base_delay_ms),
            max_delay: Duration::from_millis(self.notifier_base_delay_ms.saturating_mul(8)),
            factor: 2.0,
        }
    }
}
