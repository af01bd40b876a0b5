// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotency & validation filter.
//!
//! Every item is classified before anything is written:
//!
//! ```text
//!   mirror hit ──────────────┐
//!   mirror miss ─► SoR read ─┼─► TRANSITIONS[op][status] ─► Proceed
//!   local-only miss ─────────┘                             SkipAlreadyDone
//!                                                          Reject(code)
//! ```
//!
//! [`TRANSITIONS`] is the only place valid transitions are defined; local-only
//! and synced items go through the same rules.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::keys;
use crate::sor::client::SorBatchClient;
use crate::storage::traits::MirrorStore;
use crate::types::{fields, FailureCode, ItemRef, ItemState, ItemStatus, Operation, OperationKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    SkipAlreadyDone(String),
    Reject(FailureCode, String),
}

/// What the table says for one (operation, current status) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Run it, unless the payload already matches (no-op check)
    Allow,
    AlreadyDone(&'static str),
    Forbid(&'static str),
}

pub const TRANSITIONS: &[(OperationKind, ItemStatus, Rule)] = &[
    (OperationKind::Cancel, ItemStatus::Active, Rule::Allow),
    (OperationKind::Cancel, ItemStatus::Cancelled, Rule::AlreadyDone("already cancelled")),
    (OperationKind::Cancel, ItemStatus::Completed, Rule::Forbid("completed items cannot be cancelled")),
    (OperationKind::SetAttendance, ItemStatus::Active, Rule::Allow),
    (OperationKind::SetAttendance, ItemStatus::Cancelled, Rule::Forbid("cannot mark attendance on a cancelled item")),
    (OperationKind::SetAttendance, ItemStatus::Completed, Rule::Allow),
    (OperationKind::AdjustCounter, ItemStatus::Active, Rule::Allow),
    (OperationKind::AdjustCounter, ItemStatus::Cancelled, Rule::Forbid("cannot adjust a cancelled record")),
    (OperationKind::AdjustCounter, ItemStatus::Completed, Rule::Forbid("cannot adjust a completed record")),
];

#[must_use]
pub fn rule_for(kind: OperationKind, status: ItemStatus) -> Rule {
    TRANSITIONS
        .iter()
        .find(|(k, s, _)| *k == kind && *s == status)
        .map_or(Rule::Forbid("no transition defined"), |(_, _, rule)| *rule)
}

/// Pure classification of one item against its current state.
#[must_use]
pub fn classify(op: &Operation, current: Option<&ItemState>) -> Decision {
    let Some(state) = current else {
        return Decision::Reject(FailureCode::NotFound, "item does not exist".into());
    };

    match rule_for(op.kind(), state.status) {
        Rule::Allow => match noop_reason(op, state) {
            Some(reason) => Decision::SkipAlreadyDone(reason),
            None => Decision::Proceed,
        },
        Rule::AlreadyDone(reason) => Decision::SkipAlreadyDone(reason.into()),
        Rule::Forbid(reason) => Decision::Reject(
            FailureCode::InvalidTransition,
            format!("{} from {}: {}", op.kind(), state.status, reason),
        ),
    }
}

fn noop_reason(op: &Operation, state: &ItemState) -> Option<String> {
    match op {
        Operation::Cancel => None,
        Operation::SetAttendance { attended } if state.attended == *attended => {
            Some(format!("attendance already {:?}", attended))
        }
        Operation::AdjustCounter { value } if state.capacity == Some(*value) => {
            Some(format!("capacity already {}", value))
        }
        _ => None,
    }
}

/// One classified item with the state it was judged against.
#[derive(Debug, Clone)]
pub struct Classified {
    pub item: ItemRef,
    pub current: Option<ItemState>,
    pub decision: Decision,
}

/// Reads current state (mirror first, SoR on miss) and classifies.
pub struct IdempotencyFilter {
    mirror: Arc<dyn MirrorStore>,
    sor: Arc<SorBatchClient>,
    record_ttl: Duration,
}

impl IdempotencyFilter {
    pub fn new(mirror: Arc<dyn MirrorStore>, sor: Arc<SorBatchClient>, record_ttl: Duration) -> Self {
        Self { mirror, sor, record_ttl }
    }

    /// Classify every item, in input order.
    pub async fn classify_batch(&self, object_type: &str, items: &[ItemRef], op: &Operation) -> Vec<Classified> {
        let mut states: Vec<Lookup> = Vec::with_capacity(items.len());
        for item in items {
            states.push(self.read_mirror(object_type, item).await);
        }

        let misses: Vec<String> = items
            .iter()
            .zip(&states)
            .filter(|(_, s)| matches!(s, Lookup::Miss))
            .filter_map(|(item, _)| item.sor_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        if !misses.is_empty() {
            self.read_through(object_type, items, &misses, &mut states).await;
        }

        items
            .iter()
            .zip(states)
            .map(|(item, lookup)| match lookup {
                Lookup::Found(state) => Classified {
                    item: item.clone(),
                    decision: classify(op, Some(&state)),
                    current: Some(state),
                },
                Lookup::Miss => Classified {
                    item: item.clone(),
                    current: None,
                    decision: classify(op, None),
                },
                Lookup::Unknown(code, message) => Classified {
                    item: item.clone(),
                    current: None,
                    decision: Decision::Reject(code, message),
                },
            })
            .collect()
    }

    async fn read_mirror(&self, object_type: &str, item: &ItemRef) -> Lookup {
        let key = keys::record_for(object_type, item);
        match self.mirror.get(&key).await {
            Ok(Some(value)) => match serde_json::from_value::<ItemState>(value) {
                Ok(state) => Lookup::Found(state),
                Err(e) => {
                    warn!(key = %key, error = %e, "Undecodable mirror record, falling back to SoR");
                    Lookup::Miss
                }
            },
            Ok(None) => Lookup::Miss,
            Err(e) => {
                warn!(key = %key, error = %e, "Mirror read failed, falling back to SoR");
                Lookup::Miss
            }
        }
    }

    /// Fill misses of synced items from the SoR and cache what was found.
    async fn read_through(&self, object_type: &str, items: &[ItemRef], ids: &[String], states: &mut [Lookup]) {
        let wanted: Vec<String> = fields::ITEM_FIELDS.iter().map(|f| (*f).to_string()).collect();
        let read = self.sor.batch_read(object_type, ids, &wanted).await;
        debug!(requested = ids.len(), found = read.found.len(), failed = read.failed.len(), "Filter read-through");

        for (item, slot) in items.iter().zip(states.iter_mut()) {
            if !matches!(slot, Lookup::Miss) {
                continue;
            }
            let Some(ref id) = item.sor_id else { continue };

            if let Some(failure) = read.failed.iter().find(|f| &f.id == id) {
                *slot = Lookup::Unknown(failure.code, format!("state unknown: {}", failure.message));
                continue;
            }
            let Some(record) = read.found.get(id) else { continue };

            match ItemState::from_properties(&record.properties) {
                Ok(state) => {
                    let key = keys::synced_record(object_type, id);
                    match serde_json::to_value(&state) {
                        Ok(value) => {
                            if let Err(e) = self.mirror.set(&key, &value, self.record_ttl).await {
                                warn!(key = %key, error = %e, "Read-through cache write failed");
                            }
                        }
                        Err(e) => warn!(key = %key, error = %e, "Could not encode item state"),
                    }
                    *slot = Lookup::Found(state);
                }
                Err(message) => {
                    *slot = Lookup::Unknown(
                        FailureCode::ProviderRejected,
                        format!("unreadable SoR record: {}", message),
                    );
                }
            }
        }
    }
}

enum Lookup {
    Found(ItemState),
    Miss,
    Unknown(FailureCode, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::sor::memory::InMemorySor;
    use crate::storage::memory::InMemoryMirror;
    use serde_json::json;

    const ALL_KINDS: [OperationKind; 3] =
        [OperationKind::Cancel, OperationKind::SetAttendance, OperationKind::AdjustCounter];
    const ALL_STATUSES: [ItemStatus; 3] = [ItemStatus::Active, ItemStatus::Cancelled, ItemStatus::Completed];

    fn op_of(kind: OperationKind) -> Operation {
        match kind {
            OperationKind::Cancel => Operation::Cancel,
            OperationKind::SetAttendance => Operation::SetAttendance { attended: Some(true) },
            OperationKind::AdjustCounter => Operation::AdjustCounter { value: 10 },
        }
    }

    #[test]
    fn test_table_covers_every_pair_exactly_once() {
        for kind in ALL_KINDS {
            for status in ALL_STATUSES {
                let rows = TRANSITIONS.iter().filter(|(k, s, _)| *k == kind && *s == status).count();
                assert_eq!(rows, 1, "{:?} from {:?}", kind, status);
            }
        }
        assert_eq!(TRANSITIONS.len(), ALL_KINDS.len() * ALL_STATUSES.len());
    }

    #[test]
    fn test_every_pair_classifies_as_expected() {
        use Decision::*;
        let expected = |kind, status| match (kind, status) {
            (OperationKind::Cancel, ItemStatus::Active) => "proceed",
            (OperationKind::Cancel, ItemStatus::Cancelled) => "skip",
            (OperationKind::Cancel, ItemStatus::Completed) => "reject",
            (OperationKind::SetAttendance, ItemStatus::Active) => "proceed",
            (OperationKind::SetAttendance, ItemStatus::Cancelled) => "reject",
            (OperationKind::SetAttendance, ItemStatus::Completed) => "proceed",
            (OperationKind::AdjustCounter, ItemStatus::Active) => "proceed",
            (OperationKind::AdjustCounter, _) => "reject",
        };

        for kind in ALL_KINDS {
            for status in ALL_STATUSES {
                let state = ItemState::active(None).with_status(status);
                let got = match classify(&op_of(kind), Some(&state)) {
                    Proceed => "proceed",
                    SkipAlreadyDone(_) => "skip",
                    Reject(code, _) => {
                        assert_eq!(code, FailureCode::InvalidTransition);
                        "reject"
                    }
                };
                assert_eq!(got, expected(kind, status), "{:?} from {:?}", kind, status);
            }
        }
    }

    #[test]
    fn test_missing_state_is_not_found_for_every_kind() {
        for kind in ALL_KINDS {
            assert!(matches!(
                classify(&op_of(kind), None),
                Decision::Reject(FailureCode::NotFound, _)
            ));
        }
    }

    #[test]
    fn test_payload_noops_skip() {
        let mut state = ItemState::active(None);
        state.attended = Some(true);
        assert!(matches!(
            classify(&Operation::SetAttendance { attended: Some(true) }, Some(&state)),
            Decision::SkipAlreadyDone(_)
        ));
        assert_eq!(
            classify(&Operation::SetAttendance { attended: None }, Some(&state)),
            Decision::Proceed
        );

        let subject = ItemState::active(None).with_capacity(10);
        assert!(matches!(
            classify(&Operation::AdjustCounter { value: 10 }, Some(&subject)),
            Decision::SkipAlreadyDone(_)
        ));
        assert_eq!(classify(&Operation::AdjustCounter { value: 11 }, Some(&subject)), Decision::Proceed);
    }

    fn filter_with(mirror: Arc<InMemoryMirror>, sor: Arc<InMemorySor>) -> IdempotencyFilter {
        let client = Arc::new(SorBatchClient::new(sor, &EngineConfig::default()));
        IdempotencyFilter::new(mirror, client, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_mirror_hit_skips_sor() {
        let mirror = Arc::new(InMemoryMirror::new());
        let sor = Arc::new(InMemorySor::new(100));
        let state = ItemState::active(None).with_status(ItemStatus::Cancelled);
        mirror
            .set("items:b-1", &serde_json::to_value(&state).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        let filter = filter_with(mirror, sor.clone());
        let out = filter.classify_batch("items", &[ItemRef::synced("b-1")], &Operation::Cancel).await;

        assert!(matches!(out[0].decision, Decision::SkipAlreadyDone(_)));
        assert_eq!(sor.read_calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_reads_through_and_caches() {
        let mirror = Arc::new(InMemoryMirror::new());
        let sor = Arc::new(InMemorySor::new(100));
        sor.insert("items", "b-1", json!({"status": "active", "subject": "exam:1"}));

        let filter = filter_with(mirror.clone(), sor.clone());
        let items = [ItemRef::synced("b-1"), ItemRef::synced("ghost")];
        let out = filter.classify_batch("items", &items, &Operation::Cancel).await;

        assert_eq!(out[0].decision, Decision::Proceed);
        assert_eq!(out[0].current.as_ref().and_then(|s| s.subject.as_deref()), Some("exam:1"));
        assert!(matches!(out[1].decision, Decision::Reject(FailureCode::NotFound, _)));
        assert_eq!(sor.read_calls(), 1);
        assert!(mirror.get("items:b-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_local_only_uses_same_rules_without_sor() {
        let mirror = Arc::new(InMemoryMirror::new());
        let sor = Arc::new(InMemorySor::new(100));
        let completed = ItemState::active(None).with_status(ItemStatus::Completed);
        mirror
            .set("local:d-1", &serde_json::to_value(&completed).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        let filter = filter_with(mirror, sor.clone());
        let items = [ItemRef::local("d-1"), ItemRef::local("d-missing")];
        let out = filter.classify_batch("items", &items, &Operation::Cancel).await;

        assert!(matches!(out[0].decision, Decision::Reject(FailureCode::InvalidTransition, _)));
        assert!(matches!(out[1].decision, Decision::Reject(FailureCode::NotFound, _)));
        assert_eq!(sor.read_calls(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_mirror_record_falls_back() {
        let mirror = Arc::new(InMemoryMirror::new());
        let sor = Arc::new(InMemorySor::new(100));
        sor.insert("items", "b-1", json!({"status": "active"}));
        mirror.set("items:b-1", &json!("garbage"), Duration::from_secs(60)).await.unwrap();

        let filter = filter_with(mirror, sor.clone());
        let out = filter.classify_batch("items", &[ItemRef::synced("b-1")], &Operation::Cancel).await;

        assert_eq!(out[0].decision, Decision::Proceed);
        assert_eq!(sor.read_calls(), 1);
    }
}
