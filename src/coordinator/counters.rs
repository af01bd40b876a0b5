//! Mirror counter maintenance after SoR-confirmed writes.
//!
//! Counters move with atomic `incr_existing`. A counter that is not in the
//! mirror (never written, or expired) is seeded from the SoR, which already
//! reflects the write, with `set_if_absent_or_lower_floor` so a concurrent
//! seed never lowers it. An absent counter is never decremented from zero.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::keys;
use crate::sor::client::SorBatchClient;
use crate::sor::object_types;
use crate::storage::traits::MirrorStore;
use crate::types::fields;

pub(super) struct CounterUpdater<'a> {
    pub mirror: &'a dyn MirrorStore,
    pub sor: &'a SorBatchClient,
    pub ttl: Duration,
}

/// A capacity change confirmed by the SoR.
pub(super) struct CapacityChange {
    /// SoR id of the subject record
    pub id: String,
    pub old: Option<u64>,
    pub new: u64,
}

impl CounterUpdater<'_> {
    /// Apply one aggregated delta per subject. Returns each subject's final count.
    pub async fn apply_active_count(&self, deltas: &BTreeMap<String, i64>) -> BTreeMap<String, u64> {
        let mut finals = BTreeMap::new();
        let mut unseeded: Vec<String> = Vec::new();

        for (subject, delta) in deltas {
            let key = keys::active_count(subject);
            match self.mirror.incr_existing(&key, *delta, self.ttl).await {
                Ok(Some(value)) => {
                    finals.insert(subject.clone(), value.max(0) as u64);
                }
                Ok(None) => unseeded.push(subject.clone()),
                Err(e) => warn!(key = %key, delta, error = %e, "Counter update failed, leaving it to the sweeper"),
            }
        }

        if unseeded.is_empty() {
            return finals;
        }

        let wanted = [fields::ACTIVE_COUNT.to_string()];
        let read = self.sor.batch_read(object_types::SUBJECTS, &unseeded, &wanted).await;
        for subject in unseeded {
            let key = keys::active_count(&subject);
            let Some(sor_count) = read
                .found
                .get(&subject)
                .and_then(|r| r.properties.get(fields::ACTIVE_COUNT))
                .and_then(serde_json::Value::as_u64)
            else {
                warn!(subject = %subject, "Cannot seed counter: subject count unavailable from SoR");
                continue;
            };

            match self.seed(&key, sor_count).await {
                Some(value) => {
                    finals.insert(subject, value);
                }
                None => continue,
            }
        }
        finals
    }

    /// Move each capacity counter to its new value.
    pub async fn apply_capacity(&self, changes: &[CapacityChange]) {
        for change in changes {
            let key = keys::capacity(&change.id);
            let Some(old) = change.old else {
                // No prior capacity to diff against: the SoR value is the counter.
                if let Err(e) = self.mirror.set_counter(&key, change.new as i64, self.ttl).await {
                    warn!(key = %key, error = %e, "Counter overwrite failed");
                }
                continue;
            };

            let delta = change.new as i64 - old as i64;
            match self.mirror.incr_existing(&key, delta, self.ttl).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.seed(&key, change.new).await;
                }
                Err(e) => warn!(key = %key, delta, error = %e, "Counter update failed, leaving it to the sweeper"),
            }
        }
    }

    async fn seed(&self, key: &str, floor: u64) -> Option<u64> {
        match self.mirror.set_if_absent_or_lower_floor(key, floor as i64, self.ttl).await {
            Ok(written) => {
                debug!(key = %key, floor, written, "Seeded counter from SoR");
                match self.mirror.get_counter(key).await {
                    Ok(Some(v)) => Some(v.max(0) as u64),
                    Ok(None) => Some(floor),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Counter read after seed failed");
                        Some(floor)
                    }
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Counter seed failed");
                None
            }
        }
    }
}
