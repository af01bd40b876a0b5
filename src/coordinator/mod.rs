// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch mutation coordinator: the single entry point for bulk changes.
//!
//! ```text
//! apply(request)
//!   1. validate ─────────────────────────── MutationError (no SoR call)
//!   2. classify (mirror, SoR on miss) ───── Proceed │ Skip │ Reject
//!   3. dispatch Proceed items
//!        synced ──► SorBatchClient ──────── Succeeded │ Failed(code)
//!        local  ──► mirror write ────────── Succeeded │ Failed(MIRROR_WRITE)
//!   4. mirror: record set + counter incr_by (failures logged)
//!   5. invalidate derived views ─────────── inline or background
//!   6. notify once per subject count ────── background, never awaited
//!   7. outcomes in request order + summary
//! ```
//!
//! Steps 4 to 6 never turn a confirmed SoR write into a failed outcome; any
//! drift they leave behind is picked up by the
//! [`ReconciliationSweeper`](crate::sweeper::ReconciliationSweeper).

mod counters;
pub mod types;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::filter::{Classified, Decision, IdempotencyFilter};
use crate::invalidation::{Entity, InvalidationPropagator};
use crate::keys;
use crate::notifier::{HttpWebhook, SyncNotifier, WebhookTarget};
use crate::sor::client::SorBatchClient;
use crate::sor::http::HttpSor;
use crate::sor::object_types;
use crate::sor::traits::{SorBackend, SorUpdate};
use crate::storage::memory::InMemoryMirror;
use crate::storage::redis::RedisMirror;
use crate::storage::traits::MirrorStore;
use crate::sweeper::ReconciliationSweeper;
use crate::tasks::BackgroundTasks;
use crate::types::{FailureCode, ItemRef, ItemState, ItemStatus, MutationOutcome, MutationRequest, Operation, OperationKind};

use counters::{CapacityChange, CounterUpdater};
pub use types::{ApplyReport, MutationError, SetupError, Summary};

/// SoR object type an operation writes to.
#[must_use]
pub fn object_type_for(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Cancel | OperationKind::SetAttendance => object_types::ITEMS,
        OperationKind::AdjustCounter => object_types::SUBJECTS,
    }
}

/// Stateless across requests: share one instance behind an `Arc`.
pub struct BatchCoordinator {
    config: EngineConfig,
    mirror: Arc<dyn MirrorStore>,
    sor: Arc<SorBatchClient>,
    filter: IdempotencyFilter,
    invalidation: InvalidationPropagator,
    notifier: Arc<SyncNotifier>,
    tasks: Arc<BackgroundTasks>,
}

impl BatchCoordinator {
    pub fn new(
        config: EngineConfig,
        mirror: Arc<dyn MirrorStore>,
        sor: Arc<dyn SorBackend>,
        webhook: Option<Arc<dyn WebhookTarget>>,
    ) -> Self {
        let client = SorBatchClient::new(sor, &config);
        let notifier = SyncNotifier::new(webhook, config.notifier_retry());
        Self::from_parts(config, mirror, client, notifier)
    }

    /// Assemble from pre-built parts (e.g. a client with a circuit breaker).
    pub fn from_parts(
        config: EngineConfig,
        mirror: Arc<dyn MirrorStore>,
        sor: SorBatchClient,
        notifier: SyncNotifier,
    ) -> Self {
        let sor = Arc::new(sor);
        let tasks = Arc::new(BackgroundTasks::new(config.background_task_limit));
        let filter = IdempotencyFilter::new(mirror.clone(), sor.clone(), config.record_ttl());
        let invalidation = InvalidationPropagator::new(
            mirror.clone(),
            tasks.clone(),
            config.invalidation_sync_threshold,
            config.invalidation_timeout(),
        );

        Self {
            config,
            mirror,
            sor,
            filter,
            invalidation,
            notifier: Arc::new(notifier),
            tasks,
        }
    }

    /// Build every collaborator from configuration.
    ///
    /// Uses Redis when `redis_url` is set, an in-process mirror otherwise.
    /// `sor_base_url` is required; the webhook is optional.
    pub async fn connect(config: EngineConfig) -> Result<Self, SetupError> {
        let mirror: Arc<dyn MirrorStore> = match config.redis_url {
            Some(ref url) => Arc::new(
                RedisMirror::with_prefix(url, config.redis_prefix.as_deref())
                    .await?
                    .with_pattern_timeout(config.invalidation_timeout()),
            ),
            None => Arc::new(InMemoryMirror::new()),
        };

        let base_url = config.sor_base_url.clone().ok_or(SetupError::MissingSorUrl)?;
        let sor = Arc::new(HttpSor::new(base_url, config.sor_timeout())?);

        let webhook: Option<Arc<dyn WebhookTarget>> = match config.notifier_url {
            Some(ref url) => Some(Arc::new(HttpWebhook::new(url.clone(), config.notifier_timeout())?)),
            None => None,
        };

        info!(redis = config.redis_url.is_some(), webhook = webhook.is_some(), "Batch coordinator connected");
        Ok(Self::new(config, mirror, sor, webhook))
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn mirror(&self) -> &Arc<dyn MirrorStore> {
        &self.mirror
    }

    #[must_use]
    pub fn sor_client(&self) -> &Arc<SorBatchClient> {
        &self.sor
    }

    #[must_use]
    pub fn notifier(&self) -> &Arc<SyncNotifier> {
        &self.notifier
    }

    #[must_use]
    pub fn tasks(&self) -> &Arc<BackgroundTasks> {
        &self.tasks
    }

    /// A sweeper sharing this coordinator's mirror, SoR client and notifier.
    #[must_use]
    pub fn sweeper(&self) -> ReconciliationSweeper {
        ReconciliationSweeper::new(
            self.mirror.clone(),
            self.sor.clone(),
            self.notifier.clone(),
            self.tasks.clone(),
            &self.config,
        )
    }

    /// Start the periodic sweeper on `sweep_interval_secs`. It stops once
    /// `shutdown` flips to true.
    pub fn spawn_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sweeper = Arc::new(self.sweeper());
        tokio::spawn(sweeper.run_periodic(self.config.sweep_interval(), self.config.sweep_sample_size, shutdown))
    }

    /// Wait for detached notifications and invalidations to finish.
    pub async fn shutdown(&self) {
        info!(pending = self.tasks.stats().in_flight(), "Draining background tasks");
        self.tasks.drain().await;
    }

    /// Apply one batch mutation.
    ///
    /// Only request-shape problems return `Err`. Every per-item problem is an
    /// outcome; see [`ApplyReport::http_status`] for the all-failed case.
    #[instrument(skip(self, request), fields(
        actor = %request.actor,
        operation = %request.operation.kind(),
        items = request.items.len()
    ))]
    pub async fn apply(&self, request: MutationRequest) -> Result<ApplyReport, MutationError> {
        let _timer = crate::time_operation!("apply");
        self.validate(&request)?;
        crate::metrics::record_batch_size(request.items.len());

        let op = &request.operation;
        let object_type = object_type_for(op.kind());

        let classified = self.filter.classify_batch(object_type, &request.items, op).await;
        let mut outcomes: Vec<Option<MutationOutcome>> = vec![None; request.items.len()];
        let mut to_sor: Vec<(usize, ItemState)> = Vec::new();
        let mut to_local: Vec<(usize, ItemState)> = Vec::new();

        for (index, Classified { item, current, decision }) in classified.into_iter().enumerate() {
            match (decision, current) {
                (Decision::Proceed, Some(current)) => {
                    if item.is_local_only() {
                        to_local.push((index, current));
                    } else {
                        to_sor.push((index, current));
                    }
                }
                (Decision::Proceed, None) => {
                    outcomes[index] = Some(MutationOutcome::Failed {
                        item,
                        code: FailureCode::NotFound,
                        message: "item does not exist".into(),
                    });
                }
                (Decision::SkipAlreadyDone(reason), _) => {
                    outcomes[index] = Some(MutationOutcome::Skipped { item, reason });
                }
                (Decision::Reject(code, message), _) => {
                    outcomes[index] = Some(MutationOutcome::Failed { item, code, message });
                }
            }
        }
        debug!(dispatch = to_sor.len(), local = to_local.len(), "Classified batch");

        let confirmed = self.dispatch_sor(&request.items, object_type, op, &to_sor, &mut outcomes).await;
        let local = self.dispatch_local(&request.items, op, &to_local, &mut outcomes).await;

        let changed_counts = self.update_mirror(&request.items, object_type, op, &confirmed).await;

        let mut entities: Vec<Entity> = confirmed
            .iter()
            .chain(local.iter())
            .map(|(index, _, next)| entity_for(object_type, &request.items[*index], next))
            .collect();
        entities.extend(changed_counts.keys().map(|id| Entity::Subject { id: id.clone() }));
        if !entities.is_empty() {
            let set = self.invalidation.invalidate(&entities).await;
            debug!(patterns = set.len(), "Invalidated derived views");
        }

        for (subject, count) in changed_counts {
            self.notifier.notify_detached(&self.tasks, subject, count);
        }

        let outcomes: Vec<MutationOutcome> = outcomes
            .into_iter()
            .zip(&request.items)
            .map(|(outcome, item)| {
                outcome.unwrap_or_else(|| MutationOutcome::Failed {
                    item: item.clone(),
                    code: FailureCode::Transport,
                    message: "no outcome recorded".into(),
                })
            })
            .collect();

        let report = ApplyReport::new(outcomes);
        crate::metrics::record_outcomes(op.kind().as_str(), &report.summary);
        info!(
            actor = %request.actor,
            operation = %op.kind(),
            total = report.summary.total,
            succeeded = report.summary.succeeded,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            "Batch mutation applied"
        );
        Ok(report)
    }

    fn validate(&self, request: &MutationRequest) -> Result<(), MutationError> {
        if request.items.is_empty() {
            return Err(MutationError::EmptyBatch);
        }
        if request.items.len() > self.config.max_batch_size {
            return Err(MutationError::BatchTooLarge {
                size: request.items.len(),
                max: self.config.max_batch_size,
            });
        }
        if request.actor.trim().is_empty() {
            return Err(MutationError::Validation("actor is required".into()));
        }

        let mut keys_seen = HashSet::new();
        let mut ids_seen = HashSet::new();
        for item in &request.items {
            if item.key.is_empty() {
                return Err(MutationError::Validation("item key must not be empty".into()));
            }
            if !keys_seen.insert(item.key.as_str()) {
                return Err(MutationError::Validation(format!("duplicate item '{}'", item.key)));
            }
            if let Some(ref id) = item.sor_id {
                if id.is_empty() {
                    return Err(MutationError::Validation(format!("item '{}' has an empty SoR id", item.key)));
                }
                if !ids_seen.insert(id.as_str()) {
                    return Err(MutationError::Validation(format!("duplicate SoR id '{}'", id)));
                }
            }
        }
        Ok(())
    }

    /// Returns `(index, prior, next)` for every SoR-confirmed item.
    async fn dispatch_sor(
        &self,
        items: &[ItemRef],
        object_type: &str,
        op: &Operation,
        to_sor: &[(usize, ItemState)],
        outcomes: &mut [Option<MutationOutcome>],
    ) -> Vec<(usize, ItemState, ItemState)> {
        if to_sor.is_empty() {
            return Vec::new();
        }

        let mut by_id: BTreeMap<&str, (usize, &ItemState)> = BTreeMap::new();
        let mut updates = Vec::with_capacity(to_sor.len());
        for (index, current) in to_sor {
            let Some(ref id) = items[*index].sor_id else { continue };
            by_id.insert(id.as_str(), (*index, current));
            updates.push(SorUpdate { id: id.clone(), properties: ItemState::delta_properties(op) });
        }

        let written = self.sor.batch_write(object_type, updates).await;
        let mut confirmed = Vec::with_capacity(written.succeeded.len());

        for record in &written.succeeded {
            if let Some((index, current)) = by_id.get(record.id.as_str()) {
                let next = current.apply(op);
                outcomes[*index] = Some(MutationOutcome::Succeeded {
                    item: items[*index].clone(),
                    state: next.clone(),
                });
                confirmed.push((*index, (*current).clone(), next));
            }
        }
        for failure in written.rejected.iter().chain(&written.failed) {
            if let Some((index, _)) = by_id.get(failure.id.as_str()) {
                outcomes[*index] = Some(MutationOutcome::Failed {
                    item: items[*index].clone(),
                    code: failure.code,
                    message: failure.message.clone(),
                });
            }
        }
        confirmed
    }

    /// Local-only rows: the mirror write is the mutation.
    async fn dispatch_local(
        &self,
        items: &[ItemRef],
        op: &Operation,
        to_local: &[(usize, ItemState)],
        outcomes: &mut [Option<MutationOutcome>],
    ) -> Vec<(usize, ItemState, ItemState)> {
        let mut applied = Vec::with_capacity(to_local.len());
        for (index, current) in to_local {
            let item = &items[*index];
            let next = current.apply(op);
            let key = keys::local_record(&item.key);

            let written = match serde_json::to_value(&next) {
                Ok(value) => self
                    .mirror
                    .set(&key, &value, self.config.local_record_ttl())
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            outcomes[*index] = Some(match written {
                Ok(()) => {
                    applied.push((*index, current.clone(), next.clone()));
                    MutationOutcome::Succeeded { item: item.clone(), state: next }
                }
                Err(message) => {
                    warn!(key = %key, error = %message, "Local-only write failed");
                    MutationOutcome::Failed { item: item.clone(), code: FailureCode::MirrorWrite, message }
                }
            });
        }
        applied
    }

    /// Refresh cached records and counters for SoR-confirmed items.
    /// Returns subjects whose active count changed, with final values.
    async fn update_mirror(
        &self,
        items: &[ItemRef],
        object_type: &str,
        op: &Operation,
        confirmed: &[(usize, ItemState, ItemState)],
    ) -> BTreeMap<String, u64> {
        for (index, _, next) in confirmed {
            let key = keys::synced_record(object_type, items[*index].record_id());
            let result = match serde_json::to_value(next) {
                Ok(value) => self.mirror.set(&key, &value, self.config.record_ttl()).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = result {
                // The stale record expires by TTL; until then the next classify
                // may skip-or-proceed on old state, which the SoR write tolerates.
                warn!(key = %key, error = %e, "Mirror record update failed");
                crate::metrics::record_mirror_write_failure();
            }
        }

        let updater = CounterUpdater {
            mirror: self.mirror.as_ref(),
            sor: self.sor.as_ref(),
            ttl: self.config.counter_ttl(),
        };

        match op {
            Operation::Cancel => {
                let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
                for (_, prior, _) in confirmed {
                    if prior.status == ItemStatus::Active {
                        if let Some(ref subject) = prior.subject {
                            *deltas.entry(subject.clone()).or_insert(0) -= 1;
                        }
                    }
                }
                if deltas.is_empty() {
                    BTreeMap::new()
                } else {
                    updater.apply_active_count(&deltas).await
                }
            }
            Operation::AdjustCounter { value } => {
                let changes: Vec<CapacityChange> = confirmed
                    .iter()
                    .map(|(index, prior, _)| CapacityChange {
                        id: items[*index].record_id().to_string(),
                        old: prior.capacity,
                        new: *value,
                    })
                    .collect();
                updater.apply_capacity(&changes).await;
                BTreeMap::new()
            }
            Operation::SetAttendance { .. } => BTreeMap::new(),
        }
    }
}

fn entity_for(object_type: &str, item: &ItemRef, next: &ItemState) -> Entity {
    if object_type == object_types::SUBJECTS {
        Entity::Subject { id: item.record_id().to_string() }
    } else {
        Entity::Item { key: item.key.clone(), subject: next.subject.clone() }
    }
}
