// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation sweeper: the safety net for missed invalidations and
//! exhausted notifications.
//!
//! Each sweep:
//! 1. Re-checks every subject in the exhausted-notification ledger.
//! 2. Fills the rest of the budget with a random sample of mirror counters
//!    and cached SoR records.
//! 3. Reads the authoritative values in one batch per object type.
//! 4. Overwrites mismatches (deletes records the SoR no longer has) and
//!    re-notifies corrected or ledgered subject counts.
//!
//! Sweeps race freely with live mutations. A correction that a fresher
//! write immediately overwrites is fine; the next sweep settles it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::keys::{self, CounterKey};
use crate::notifier::SyncNotifier;
use crate::sor::client::SorBatchClient;
use crate::sor::object_types;
use crate::storage::traits::MirrorStore;
use crate::tasks::BackgroundTasks;
use crate::types::{fields, ItemState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys and ledger subjects compared against the SoR
    pub checked: usize,
    /// Mirror entries overwritten or deleted
    pub corrected: usize,
    /// Downstream notifications scheduled
    pub renotified: usize,
    /// Entries left alone because the SoR read failed
    pub skipped: usize,
}

pub struct ReconciliationSweeper {
    mirror: Arc<dyn MirrorStore>,
    sor: Arc<SorBatchClient>,
    notifier: Arc<SyncNotifier>,
    tasks: Arc<BackgroundTasks>,
    counter_ttl: Duration,
    record_ttl: Duration,
}

/// What one sweep decided to look at.
#[derive(Default)]
struct Sample {
    /// Subjects whose active count is checked, and whether each came from the ledger
    active_counts: BTreeMap<String, bool>,
    capacities: BTreeSet<String>,
    /// object type -> record keys
    records: BTreeMap<&'static str, Vec<String>>,
}

impl ReconciliationSweeper {
    pub fn new(
        mirror: Arc<dyn MirrorStore>,
        sor: Arc<SorBatchClient>,
        notifier: Arc<SyncNotifier>,
        tasks: Arc<BackgroundTasks>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            mirror,
            sor,
            notifier,
            tasks,
            counter_ttl: config.counter_ttl(),
            record_ttl: config.record_ttl(),
        }
    }

    #[instrument(skip(self))]
    pub async fn sweep(&self, sample_size: usize) -> SweepReport {
        let mut report = SweepReport::default();
        let sample = self.sample(sample_size).await;
        if sample.active_counts.is_empty() && sample.capacities.is_empty() && sample.records.is_empty() {
            debug!("Nothing to sweep");
            return report;
        }

        self.check_subjects(&sample, &mut report).await;
        for (object_type, ids) in &sample.records {
            self.check_records(*object_type, ids, &mut report).await;
        }

        crate::metrics::record_sweep(report.checked, report.corrected);
        info!(
            checked = report.checked,
            corrected = report.corrected,
            renotified = report.renotified,
            skipped = report.skipped,
            "Reconciliation sweep finished"
        );
        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` flips to true.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, sample_size: usize, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), sample_size, "Reconciliation sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(sample_size).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciliation sweeper stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn sample(&self, sample_size: usize) -> Sample {
        let mut sample = Sample::default();

        for entry in self.notifier.ledger().entries().into_iter().take(sample_size) {
            sample.active_counts.insert(entry.subject_id, true);
        }
        let budget = sample_size.saturating_sub(sample.active_counts.len());
        if budget == 0 {
            return sample;
        }

        let mut candidates: Vec<String> = Vec::new();
        let mut patterns = vec![
            format!("{}*", keys::ACTIVE_COUNT_PREFIX),
            format!("{}*", keys::CAPACITY_PREFIX),
        ];
        patterns.extend(keys::SYNCED_RECORD_TYPES.iter().map(|t| keys::synced_record_pattern(t)));
        for pattern in &patterns {
            // Oversample so the shuffle has something to choose from.
            match self.mirror.scan(pattern, budget.saturating_mul(4)).await {
                Ok(found) => candidates.extend(found),
                Err(e) => warn!(pattern = %pattern, error = %e, "Sweeper scan failed"),
            }
        }
        candidates.shuffle(&mut rand::thread_rng());

        let mut taken = 0;
        for key in candidates {
            if taken == budget {
                break;
            }
            if let Some(counter) = CounterKey::parse(&key) {
                match counter {
                    CounterKey::ActiveCount(subject) => {
                        if sample.active_counts.contains_key(subject) {
                            continue;
                        }
                        sample.active_counts.insert(subject.to_string(), false);
                    }
                    CounterKey::Capacity(subject) => {
                        sample.capacities.insert(subject.to_string());
                    }
                }
                taken += 1;
            } else if let Some((object_type, id)) = keys::parse_synced_record(&key) {
                sample.records.entry(object_type).or_default().push(id.to_string());
                taken += 1;
            }
        }
        sample
    }

    async fn check_subjects(&self, sample: &Sample, report: &mut SweepReport) {
        let ids: Vec<String> = sample
            .active_counts
            .keys()
            .chain(sample.capacities.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return;
        }

        let wanted = [fields::ACTIVE_COUNT.to_string(), fields::CAPACITY.to_string()];
        let read = self.sor.batch_read(object_types::SUBJECTS, &ids, &wanted).await;

        for (subject, from_ledger) in &sample.active_counts {
            report.checked += 1;
            if read.is_unknown(subject) {
                report.skipped += 1;
                continue;
            }
            let key = keys::active_count(subject);
            let sor_value = read
                .found
                .get(subject)
                .and_then(|r| r.properties.get(fields::ACTIVE_COUNT))
                .and_then(Value::as_u64);

            let corrected = self.reconcile_counter(&key, sor_value, report).await;
            if let Some(count) = sor_value {
                if corrected || *from_ledger {
                    self.notifier.notify_detached(&self.tasks, subject.clone(), count);
                    report.renotified += 1;
                }
            }
        }

        for subject in &sample.capacities {
            report.checked += 1;
            if read.is_unknown(subject) {
                report.skipped += 1;
                continue;
            }
            let sor_value = read
                .found
                .get(subject)
                .and_then(|r| r.properties.get(fields::CAPACITY))
                .and_then(Value::as_u64);
            self.reconcile_counter(&keys::capacity(subject), sor_value, report).await;
        }
    }

    /// Returns true when the mirror was changed.
    async fn reconcile_counter(&self, key: &str, sor_value: Option<u64>, report: &mut SweepReport) -> bool {
        let mirror_value = match self.mirror.get_counter(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, error = %e, "Sweeper counter read failed");
                report.skipped += 1;
                return false;
            }
        };

        match (mirror_value, sor_value) {
            (Some(mirror), Some(sor)) if mirror != sor as i64 => {
                info!(key = %key, mirror, sor, "Correcting counter drift");
                match self.mirror.set_counter(key, sor as i64, self.counter_ttl).await {
                    Ok(()) => {
                        report.corrected += 1;
                        true
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Counter correction failed");
                        false
                    }
                }
            }
            (Some(mirror), None) => {
                info!(key = %key, mirror, "Dropping counter with no SoR value");
                match self.mirror.delete(key).await {
                    Ok(()) => {
                        report.corrected += 1;
                        true
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Counter delete failed");
                        false
                    }
                }
            }
            // Matching, or expired since sampling: nothing to fix
            _ => false,
        }
    }

    async fn check_records(&self, object_type: &'static str, ids: &[String], report: &mut SweepReport) {
        let wanted: Vec<String> = fields::ITEM_FIELDS.iter().map(|f| (*f).to_string()).collect();
        let read = self.sor.batch_read(object_type, ids, &wanted).await;

        for id in ids {
            report.checked += 1;
            if read.is_unknown(id) {
                report.skipped += 1;
                continue;
            }
            let key = keys::synced_record(object_type, id);

            let Some(record) = read.found.get(id) else {
                info!(key = %key, "Dropping cached record the SoR no longer has");
                match self.mirror.delete(&key).await {
                    Ok(()) => report.corrected += 1,
                    Err(e) => warn!(key = %key, error = %e, "Record delete failed"),
                }
                continue;
            };

            let sor_state = match ItemState::from_properties(&record.properties) {
                Ok(state) => state,
                Err(e) => {
                    warn!(key = %key, error = %e, "Unreadable SoR record, leaving mirror as is");
                    report.skipped += 1;
                    continue;
                }
            };

            let mirror_state = match self.mirror.get(&key).await {
                Ok(Some(value)) => serde_json::from_value::<ItemState>(value).ok(),
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Sweeper record read failed");
                    report.skipped += 1;
                    continue;
                }
            };

            if mirror_state.as_ref() == Some(&sor_state) {
                continue;
            }
            info!(
                key = %key,
                mirror = ?mirror_state.as_ref().map(|s| s.status),
                sor = %sor_state.status,
                "Correcting cached record"
            );
            let written = match serde_json::to_value(&sor_state) {
                Ok(value) => self.mirror.set(&key, &value, self.record_ttl).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match written {
                Ok(()) => report.corrected += 1,
                Err(e) => warn!(key = %key, error = %e, "Record correction failed"),
            }
        }
    }
}
