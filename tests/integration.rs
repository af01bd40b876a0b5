//! Integration Tests for the Batch Sync Engine
//!
//! End-to-end scenarios through [`BatchCoordinator::apply`]. Most run against
//! the in-process mirror and SoR; the Redis tests use testcontainers, so no
//! external docker-compose is required.
//!
//! # Running Tests
//! ```bash
//! # In-process scenarios only
//! cargo test --test integration
//!
//! # Include the Redis-backed scenarios (requires Docker)
//! cargo test --test integration -- --include-ignored
//!
//! # Only failure scenarios
//! cargo test --test integration failure
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: mixed batches, idempotent replays, drift repair
//! - `failure_*` - Downstream failures that must not change item outcomes
//! - `redis_*` - The same guarantees against a real Redis mirror

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use batch_sync_engine::invalidation::InvalidationSet;
use batch_sync_engine::notifier::NotifyError;
use batch_sync_engine::sor::memory::InMemorySor;
use batch_sync_engine::storage::memory::InMemoryMirror;
use batch_sync_engine::storage::redis::RedisMirror;
use batch_sync_engine::{
    BatchCoordinator, CountUpdate, EngineConfig, Entity, FailureCode, ItemRef, ItemState, ItemStatus,
    MirrorStore, MutationOutcome, MutationRequest, Operation, Summary, WebhookTarget,
};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

// =============================================================================
// Helpers
// =============================================================================

/// Create a Redis container with health check
fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Webhook that records every delivery
#[derive(Default)]
struct RecordingWebhook {
    updates: Mutex<Vec<CountUpdate>>,
}

#[async_trait]
impl WebhookTarget for RecordingWebhook {
    async fn deliver(&self, update: &CountUpdate) -> Result<(), NotifyError> {
        self.updates.lock().push(update.clone());
        Ok(())
    }
}

/// Webhook whose receiver is always down
struct DeadWebhook;

#[async_trait]
impl WebhookTarget for DeadWebhook {
    async fn deliver(&self, _update: &CountUpdate) -> Result<(), NotifyError> {
        Err(NotifyError::Status(503))
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        rate_limit_base_delay_ms: 1,
        rate_limit_max_delay_ms: 4,
        notifier_base_delay_ms: 1,
        ..Default::default()
    }
}

struct Harness {
    coordinator: BatchCoordinator,
    mirror: Arc<InMemoryMirror>,
    sor: Arc<InMemorySor>,
    webhook: Arc<RecordingWebhook>,
}

fn harness() -> Harness {
    let mirror = Arc::new(InMemoryMirror::new());
    let sor = Arc::new(InMemorySor::new(100));
    let webhook = Arc::new(RecordingWebhook::default());
    let coordinator = BatchCoordinator::new(fast_config(), mirror.clone(), sor.clone(), Some(webhook.clone()));
    Harness { coordinator, mirror, sor, webhook }
}

fn seed_subject(sor: &InMemorySor, subject: &str, active: &[&str], cancelled: &[&str]) {
    sor.insert("subjects", subject, json!({"status": "active", "capacity": 30}));
    for id in active {
        sor.insert("items", id, json!({"status": "active", "subject": subject}));
    }
    for id in cancelled {
        sor.insert("items", id, json!({"status": "cancelled", "subject": subject}));
    }
}

fn synced(ids: &[&str]) -> Vec<ItemRef> {
    ids.iter().map(|id| ItemRef::synced(*id)).collect()
}

fn cancel(ids: &[&str]) -> MutationRequest {
    MutationRequest::new(synced(ids), Operation::Cancel, "admin@example.com")
}

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn happy_mixed_state_batch_partitions_outcomes() {
    let h = harness();
    seed_subject(&h.sor, "exam:1", &["A"], &["B"]);

    let report = h.coordinator.apply(cancel(&["A", "B", "C"])).await.unwrap();
    h.coordinator.shutdown().await;

    assert_eq!(report.summary, Summary { total: 3, succeeded: 1, failed: 1, skipped: 1 });
    assert_eq!(report.http_status(), 207);

    // One outcome per item, in request order
    let keys: Vec<&str> = report.outcomes.iter().map(|o| o.item().key.as_str()).collect();
    assert_eq!(keys, vec!["A", "B", "C"]);
    assert!(report.outcomes[0].is_succeeded());
    assert!(report.outcomes[1].is_skipped());
    assert_eq!(report.outcomes[2].failure_code(), Some(FailureCode::NotFound));

    assert_eq!(h.sor.row("items", "A").unwrap()["status"], json!("cancelled"));
}

#[tokio::test]
async fn happy_replayed_batch_is_all_skips_and_leaves_mirror_unchanged() {
    let h = harness();
    seed_subject(&h.sor, "exam:1", &["b-1", "b-2", "b-3"], &[]);

    let first = h.coordinator.apply(cancel(&["b-1", "b-2"])).await.unwrap();
    h.coordinator.shutdown().await;
    assert_eq!(first.summary.succeeded, 2);
    let after_first = h.mirror.snapshot();
    let writes_after_first = h.sor.write_calls();

    let second = h.coordinator.apply(cancel(&["b-1", "b-2"])).await.unwrap();
    h.coordinator.shutdown().await;

    assert_eq!(second.summary, Summary { total: 2, succeeded: 0, failed: 0, skipped: 2 });
    assert_eq!(second.http_status(), 200);
    assert_eq!(h.mirror.snapshot(), after_first);
    assert_eq!(h.sor.write_calls(), writes_after_first);

    // The counter moved exactly once per item; one push per apply that changed it
    assert_eq!(h.mirror.get_counter("count:exam:1").await.unwrap(), Some(1));
    assert_eq!(h.webhook.updates.lock().len(), 1);
}

#[tokio::test]
async fn happy_counter_drift_is_repaired_by_sweep() {
    let h = harness();
    let active: Vec<String> = (0..7).map(|i| format!("exam42-b{}", i)).collect();
    let active: Vec<&str> = active.iter().map(String::as_str).collect();
    seed_subject(&h.sor, "exam:42", &active, &[]);

    // A lost notification left the mirror two behind
    h.mirror.set_counter("count:exam:42", 5, Duration::from_secs(3600)).await.unwrap();

    let report = h.coordinator.sweeper().sweep(10).await;
    h.coordinator.shutdown().await;

    assert!(report.corrected >= 1);
    assert_eq!(h.mirror.get_counter("count:exam:42").await.unwrap(), Some(7));
    let updates = h.webhook.updates.lock();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].subject_id, "exam:42");
    assert_eq!(updates[0].count, 7);
}

#[tokio::test]
async fn happy_cancel_purges_every_derived_view() {
    let h = harness();
    seed_subject(&h.sor, "exam:1", &["b-1"], &[]);
    let ttl = Duration::from_secs(60);
    for key in ["detail:b-1", "list:exam:1:page1", "list:exam:1:page2", "aggregate:daily", "list:exam:2:page1"] {
        h.mirror.set(key, &json!({"cached": true}), ttl).await.unwrap();
    }

    h.coordinator.apply(cancel(&["b-1"])).await.unwrap();
    h.coordinator.shutdown().await;

    let patterns = InvalidationSet::for_entities(&[Entity::Item {
        key: "b-1".into(),
        subject: Some("exam:1".into()),
    }]);
    for pattern in patterns.iter() {
        assert!(
            h.mirror.scan(pattern, 10).await.unwrap().is_empty(),
            "pattern {} still has live keys",
            pattern
        );
    }
    // Another subject's list is left alone
    assert!(h.mirror.get("list:exam:2:page1").await.unwrap().is_some());
}

#[tokio::test]
async fn happy_attendance_on_completed_items_and_noop_skip() {
    let h = harness();
    h.sor.insert("items", "b-1", json!({"status": "completed", "subject": "exam:1"}));
    h.sor.insert("items", "b-2", json!({"status": "completed", "subject": "exam:1", "attended": true}));
    h.sor.insert("items", "b-3", json!({"status": "cancelled", "subject": "exam:1"}));

    let request = MutationRequest::new(
        synced(&["b-1", "b-2", "b-3"]),
        Operation::SetAttendance { attended: Some(true) },
        "proctor",
    );
    let report = h.coordinator.apply(request).await.unwrap();
    h.coordinator.shutdown().await;

    assert!(report.outcomes[0].is_succeeded());
    assert!(report.outcomes[1].is_skipped());
    assert_eq!(report.outcomes[2].failure_code(), Some(FailureCode::InvalidTransition));
    assert_eq!(h.sor.row("items", "b-1").unwrap()["attended"], json!(true));

    // Attendance never touches the active count
    assert!(h.webhook.updates.lock().is_empty());
}

#[tokio::test]
async fn happy_local_only_items_never_reach_the_sor() {
    let h = harness();
    let state = serde_json::to_value(ItemState::active(None)).unwrap();
    h.mirror.set("local:draft-1", &state, Duration::from_secs(60)).await.unwrap();

    let request = MutationRequest::new(
        vec![ItemRef::local("draft-1"), ItemRef::local("draft-2")],
        Operation::Cancel,
        "admin",
    );
    let report = h.coordinator.apply(request).await.unwrap();
    h.coordinator.shutdown().await;

    assert!(report.outcomes[0].is_succeeded());
    assert_eq!(report.outcomes[1].failure_code(), Some(FailureCode::NotFound));
    assert_eq!(h.sor.read_calls() + h.sor.write_calls(), 0);

    let stored: ItemState = serde_json::from_value(h.mirror.get("local:draft-1").await.unwrap().unwrap()).unwrap();
    assert_eq!(stored.status, ItemStatus::Cancelled);
}

#[tokio::test]
async fn happy_adjust_counter_updates_capacity() {
    let h = harness();
    seed_subject(&h.sor, "exam:5", &[], &[]);
    h.sor.insert("subjects", "exam:6", json!({"status": "cancelled", "capacity": 10}));

    let request = MutationRequest::new(synced(&["exam:5", "exam:6"]), Operation::AdjustCounter { value: 45 }, "ops");
    let report = h.coordinator.apply(request).await.unwrap();
    h.coordinator.shutdown().await;

    assert!(report.outcomes[0].is_succeeded());
    assert_eq!(report.outcomes[1].failure_code(), Some(FailureCode::InvalidTransition));
    assert_eq!(h.sor.row("subjects", "exam:5").unwrap()["capacity"], json!(45));
    assert_eq!(h.mirror.get_counter("capacity:exam:5").await.unwrap(), Some(45));
}

/// A row created locally as `draft` and synced later as `sor_id`.
fn promoted(draft: &str, sor_id: &str) -> ItemRef {
    ItemRef { key: draft.into(), sor_id: Some(sor_id.into()) }
}

#[tokio::test]
async fn happy_promoted_draft_is_tracked_by_sor_id() {
    let h = harness();
    // `draft-1` also exists in the SoR as an unrelated active row.
    seed_subject(&h.sor, "exam:1", &["X", "draft-1", "Y"], &[]);
    let request = || MutationRequest::new(vec![promoted("draft-1", "X")], Operation::Cancel, "admin@example.com");

    let first = h.coordinator.apply(request()).await.unwrap();
    h.coordinator.shutdown().await;

    assert!(first.outcomes[0].is_succeeded());
    assert_eq!(first.outcomes[0].item().key, "draft-1");
    assert_eq!(h.sor.row("items", "X").unwrap()["status"], json!("cancelled"));
    assert_eq!(h.sor.row("items", "draft-1").unwrap()["status"], json!("active"));
    assert_eq!(h.mirror.get_counter("count:exam:1").await.unwrap(), Some(2));

    let cached: ItemState = serde_json::from_value(h.mirror.get("items:X").await.unwrap().unwrap()).unwrap();
    assert_eq!(cached.status, ItemStatus::Cancelled);
    assert!(h.mirror.get("items:draft-1").await.unwrap().is_none());

    // Nothing drifted, so the sweeper has nothing to repair
    let sweep = h.coordinator.sweeper().sweep(10).await;
    h.coordinator.shutdown().await;
    assert_eq!(sweep.corrected, 0);

    let replay = h.coordinator.apply(request()).await.unwrap();
    h.coordinator.shutdown().await;

    assert_eq!(replay.summary, Summary { total: 1, succeeded: 0, failed: 0, skipped: 1 });
    assert_eq!(h.mirror.get_counter("count:exam:1").await.unwrap(), Some(2));
    assert_eq!(h.sor.active_count("exam:1"), 2);
}

#[tokio::test]
async fn happy_promoted_subject_capacity_keyed_by_sor_id() {
    let h = harness();
    seed_subject(&h.sor, "exam:5", &[], &[]);
    let request = MutationRequest::new(
        vec![promoted("draft-exam", "exam:5")],
        Operation::AdjustCounter { value: 45 },
        "ops",
    );

    let report = h.coordinator.apply(request).await.unwrap();
    h.coordinator.shutdown().await;

    assert!(report.outcomes[0].is_succeeded());
    assert_eq!(h.mirror.get_counter("capacity:exam:5").await.unwrap(), Some(45));
    assert_eq!(h.mirror.get_counter("capacity:draft-exam").await.unwrap(), None);

    let sweep = h.coordinator.sweeper().sweep(10).await;
    assert_eq!(sweep.corrected, 0);
    assert_eq!(h.mirror.get_counter("capacity:exam:5").await.unwrap(), Some(45));
}

#[tokio::test]
async fn happy_concurrent_batches_on_one_subject_compose() {
    let h = harness();
    let ids: Vec<String> = (0..20).map(|i| format!("b-{}", i)).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    seed_subject(&h.sor, "exam:9", &refs, &[]);
    h.mirror.set_counter("count:exam:9", 20, Duration::from_secs(3600)).await.unwrap();

    let (left, right) = tokio::join!(
        h.coordinator.apply(cancel(&refs[..10])),
        h.coordinator.apply(cancel(&refs[10..])),
    );
    h.coordinator.shutdown().await;

    assert_eq!(left.unwrap().summary.succeeded, 10);
    assert_eq!(right.unwrap().summary.succeeded, 10);
    assert_eq!(h.mirror.get_counter("count:exam:9").await.unwrap(), Some(0));
    assert_eq!(h.sor.active_count("exam:9"), 0);
}

#[tokio::test]
async fn happy_all_failed_batch_is_a_report_not_an_error() {
    let h = harness();

    let report = h.coordinator.apply(cancel(&["ghost-1", "ghost-2"])).await.unwrap();

    assert_eq!(report.http_status(), 422);
    assert!(report.summary.all_failed());
    assert!(report.failed().all(|o| o.failure_code() == Some(FailureCode::NotFound)));
}

#[tokio::test]
async fn happy_report_serializes_for_host_handlers() {
    let h = harness();
    seed_subject(&h.sor, "exam:1", &["b-1"], &[]);

    let report = h.coordinator.apply(cancel(&["b-1", "nope"])).await.unwrap();
    let body = serde_json::to_value(&report).unwrap();

    assert_eq!(body["summary"]["total"], json!(2));
    assert_eq!(body["outcomes"][0]["outcome"], json!("succeeded"));
    assert_eq!(body["outcomes"][1]["code"], json!("NOT_FOUND"));
}

// =============================================================================
// Failure Scenarios
// =============================================================================

#[tokio::test]
async fn failure_notifier_exhaustion_does_not_fail_the_item() {
    let mirror = Arc::new(InMemoryMirror::new());
    let sor = Arc::new(InMemorySor::new(100));
    seed_subject(&sor, "exam:3", &["b-1", "b-2"], &[]);
    let coordinator = BatchCoordinator::new(fast_config(), mirror.clone(), sor.clone(), Some(Arc::new(DeadWebhook)));

    let report = coordinator.apply(cancel(&["b-1"])).await.unwrap();
    coordinator.shutdown().await;

    assert_eq!(report.http_status(), 200);
    assert!(matches!(report.outcomes[0], MutationOutcome::Succeeded { .. }));

    // The give-up is recorded for the sweeper instead of surfacing to the caller
    let ledger = coordinator.notifier().ledger();
    assert!(ledger.contains("exam:3"));
    assert_eq!(ledger.entries()[0].count, 1);
    assert_eq!(coordinator.tasks().stats().failed, 1);
}

#[tokio::test]
async fn failure_exhausted_notification_is_redelivered_by_sweep() {
    let mirror = Arc::new(InMemoryMirror::new());
    let sor = Arc::new(InMemorySor::new(100));
    seed_subject(&sor, "exam:3", &["b-1", "b-2"], &[]);
    let dead = BatchCoordinator::new(fast_config(), mirror.clone(), sor.clone(), Some(Arc::new(DeadWebhook)));
    dead.apply(cancel(&["b-1"])).await.unwrap();
    dead.shutdown().await;

    // Receiver comes back: a sweeper sharing the ledger re-pushes
    let webhook = Arc::new(RecordingWebhook::default());
    let recovered = BatchCoordinator::from_parts(
        fast_config(),
        mirror.clone(),
        batch_sync_engine::SorBatchClient::new(sor.clone(), &fast_config()),
        batch_sync_engine::notifier::notifier_with(webhook.clone(), 3, Duration::from_millis(1)),
    );
    for entry in dead.notifier().ledger().entries() {
        recovered.notifier().ledger().record(entry);
    }

    let report = recovered.sweeper().sweep(5).await;
    recovered.shutdown().await;

    assert_eq!(report.renotified, 1);
    assert_eq!(webhook.updates.lock()[0].count, 1);
    assert!(recovered.notifier().ledger().is_empty());
}

// =============================================================================
// Redis Mirror
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_counters_clamp_at_zero() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));
    let mirror = RedisMirror::new(&url).await.expect("Failed to connect to Redis");
    let ttl = Duration::from_secs(60);

    assert_eq!(mirror.incr_by("count:exam:1", 2, ttl).await.unwrap(), 2);
    assert_eq!(mirror.incr_by("count:exam:1", -5, ttl).await.unwrap(), 0);
    assert_eq!(mirror.get_counter("count:exam:1").await.unwrap(), Some(0));

    assert!(mirror.set_if_absent_or_lower_floor("count:exam:2", 4, ttl).await.unwrap());
    assert!(!mirror.set_if_absent_or_lower_floor("count:exam:2", 3, ttl).await.unwrap());
    assert_eq!(mirror.get_counter("count:exam:2").await.unwrap(), Some(4));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_pattern_purge_and_prefixed_scan() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));
    let ours = format!("bookings-{}:", uuid::Uuid::new_v4());
    let theirs = format!("bookings-{}:", uuid::Uuid::new_v4());
    let mirror = RedisMirror::with_prefix(&url, Some(&ours)).await.unwrap();
    let neighbour = RedisMirror::with_prefix(&url, Some(&theirs)).await.unwrap();
    let ttl = Duration::from_secs(60);

    for key in ["list:exam:1:p1", "list:exam:1:p2", "list:exam:2:p1"] {
        mirror.set(key, &json!({"rows": []}), ttl).await.unwrap();
    }
    neighbour.set("list:exam:1:p1", &json!({"rows": []}), ttl).await.unwrap();

    assert_eq!(mirror.delete_pattern("list:exam:1:*").await.unwrap(), 2);
    assert_eq!(mirror.delete_pattern("list:exam:7:*").await.unwrap(), 0);

    let left = mirror.scan("list:*", 10).await.unwrap();
    assert_eq!(left, vec!["list:exam:2:p1".to_string()]);
    assert!(neighbour.get("list:exam:1:p1").await.unwrap().is_some());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_end_to_end_cancel_and_replay() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));
    let mirror: Arc<dyn MirrorStore> = Arc::new(RedisMirror::new(&url).await.unwrap());

    let sor = Arc::new(InMemorySor::new(100));
    seed_subject(&sor, "exam:1", &["b-1", "b-2", "b-3"], &[]);
    let webhook = Arc::new(RecordingWebhook::default());
    let coordinator = BatchCoordinator::new(fast_config(), mirror.clone(), sor.clone(), Some(webhook.clone()));

    let first = coordinator.apply(cancel(&["b-1", "b-2"])).await.unwrap();
    let second = coordinator.apply(cancel(&["b-1", "b-2"])).await.unwrap();
    coordinator.shutdown().await;

    assert_eq!(first.summary.succeeded, 2);
    assert_eq!(second.summary.skipped, 2);
    assert_eq!(mirror.get_counter("count:exam:1").await.unwrap(), Some(1));

    let cached: ItemState = serde_json::from_value(mirror.get("items:b-1").await.unwrap().unwrap()).unwrap();
    assert_eq!(cached.status, ItemStatus::Cancelled);
    assert_eq!(webhook.updates.lock().len(), 1);
}
