// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync notifier: push a subject's final count downstream, best effort.
//!
//! Each attempt is an idempotent "set count to X", so replays are safe.
//! Attempts back off exponentially (0s, 2s, 6s with the defaults). When the
//! budget runs out the failure is logged and written to the
//! [`ExhaustedLedger`] for the sweeper; callers never see an error.

pub mod http;
pub mod ledger;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::resilience::retry::{retry_when, RetryConfig, RetryHint};
use crate::storage::traits::now_ms;
use crate::tasks::BackgroundTasks;

pub use http::HttpWebhook;
pub use ledger::{ExhaustedLedger, ExhaustedNotification};

#[derive(Error, Debug, Clone)]
pub enum NotifyError {
    #[error("Webhook transport failure: {0}")]
    Transport(String),
    #[error("Webhook returned HTTP {0}")]
    Status(u16),
}

impl RetryHint for NotifyError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(code) => *code == 429 || *code >= 500,
        }
    }
}

/// Webhook body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountUpdate {
    pub subject_id: String,
    pub count: u64,
    /// Epoch millis when the notification was created
    pub timestamp: i64,
}

/// Downstream receiver. Must tolerate duplicate deliveries.
#[async_trait]
pub trait WebhookTarget: Send + Sync {
    async fn deliver(&self, update: &CountUpdate) -> Result<(), NotifyError>;
}

/// One delivery attempt's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncNotification {
    pub subject_id: String,
    pub new_count: u64,
    pub attempt: usize,
    pub max_attempts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered { attempts: usize },
    Exhausted { attempts: usize },
    /// No webhook configured
    Disabled,
}

pub struct SyncNotifier {
    target: Option<Arc<dyn WebhookTarget>>,
    retry: RetryConfig,
    ledger: Arc<ExhaustedLedger>,
    /// Orders notifications for the same subject
    issued: AtomicU64,
}

impl SyncNotifier {
    pub fn new(target: Option<Arc<dyn WebhookTarget>>, retry: RetryConfig) -> Self {
        Self {
            target,
            retry,
            ledger: Arc::new(ExhaustedLedger::new()),
            issued: AtomicU64::new(0),
        }
    }

    /// A notifier that drops everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(None, RetryConfig::default())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<ExhaustedLedger> {
        &self.ledger
    }

    /// Deliver with retries. Never fails; exhaustion is logged and recorded.
    pub async fn notify(&self, subject_id: &str, new_count: u64) -> NotifyOutcome {
        let Some(target) = self.target.clone() else {
            return NotifyOutcome::Disabled;
        };
        let sequence = self.issued.fetch_add(1, Ordering::Relaxed) + 1;

        let update = CountUpdate {
            subject_id: subject_id.to_string(),
            count: new_count,
            timestamp: now_ms(),
        };
        let max_attempts = self.retry.max_retries.unwrap_or(usize::MAX);
        let mut attempt = 0usize;

        let result = retry_when("sync_notification", &self.retry, || {
            attempt += 1;
            let notification = SyncNotification {
                subject_id: update.subject_id.clone(),
                new_count,
                attempt,
                max_attempts,
            };
            let target = target.clone();
            let update = update.clone();
            async move {
                debug!(
                    subject = %notification.subject_id,
                    count = notification.new_count,
                    attempt = notification.attempt,
                    max_attempts = notification.max_attempts,
                    "Delivering sync notification"
                );
                target.deliver(&update).await
            }
        })
        .await;

        match result {
            Ok(()) => {
                crate::metrics::record_notification("delivered", attempt);
                // A newer count that already failed stays recorded.
                if self.ledger.clear_through(subject_id, sequence) {
                    debug!(subject = %subject_id, "Cleared exhausted notification");
                }
                NotifyOutcome::Delivered { attempts: attempt }
            }
            Err(e) => {
                let timestamp_ms = now_ms();
                error!(
                    subject = %subject_id,
                    count = new_count,
                    attempts = attempt,
                    timestamp_ms,
                    error = %e,
                    "Sync notification exhausted"
                );
                crate::metrics::record_notification("exhausted", attempt);
                self.ledger.record(ExhaustedNotification {
                    subject_id: subject_id.to_string(),
                    count: new_count,
                    attempts: attempt,
                    timestamp_ms,
                    sequence,
                });
                NotifyOutcome::Exhausted { attempts: attempt }
            }
        }
    }

    /// Fire-and-forget [`notify`](Self::notify) through the background runner.
    pub fn notify_detached(self: &Arc<Self>, tasks: &BackgroundTasks, subject_id: String, new_count: u64) {
        if !self.is_enabled() {
            return;
        }
        let notifier = self.clone();
        tasks.spawn("sync_notification", async move {
            match notifier.notify(&subject_id, new_count).await {
                NotifyOutcome::Exhausted { attempts } => {
                    Err(format!("notification for {} exhausted after {} attempts", subject_id, attempts))
                }
                _ => Ok(()),
            }
        });
    }
}

/// Shorthand for a notifier with the given retry timing.
pub fn notifier_with(target: Arc<dyn WebhookTarget>, max_attempts: usize, base_delay: Duration) -> SyncNotifier {
    SyncNotifier::new(
        Some(target),
        RetryConfig {
            max_retries: Some(max_attempts.max(1)),
            initial_delay: base_delay,
            max_delay: base_delay.saturating_mul(8),
            factor: 2.0,
        },
    )
}
