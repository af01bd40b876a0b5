// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic batch-sync-engine usage example.
//!
//! Demonstrates:
//! 1. Wiring a coordinator over an in-process SoR and mirror
//! 2. A mixed-state cancel batch (partial success, one report)
//! 3. Replaying the same batch (everything skipped)
//! 4. Repairing counter drift with a reconciliation sweep
//! 5. Displaying captured metrics
//! 6. Clean shutdown
//!
//! Set `REDIS_URL` to use a real Redis mirror instead of the in-process one.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! RUST_LOG=batch_sync_engine=debug cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use batch_sync_engine::notifier::NotifyError;
use batch_sync_engine::sor::memory::InMemorySor;
use batch_sync_engine::storage::memory::InMemoryMirror;
use batch_sync_engine::storage::redis::RedisMirror;
use batch_sync_engine::{
    BatchCoordinator, CountUpdate, EngineConfig, ItemRef, MirrorStore, MutationOutcome, MutationRequest, Operation,
    WebhookTarget,
};

/// Prints every count push instead of calling a real endpoint.
struct ConsoleWebhook;

#[async_trait]
impl WebhookTarget for ConsoleWebhook {
    async fn deliver(&self, update: &CountUpdate) -> Result<(), NotifyError> {
        println!("   📣 webhook ← {}", serde_json::to_string(update).unwrap_or_default());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║        batch-sync-engine: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Seed the system of record and wire the coordinator
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Seeding the system of record...");
    let config = EngineConfig {
        sor_chunk_size: 2,
        ..Default::default()
    };

    let sor = Arc::new(InMemorySor::new(config.sor_chunk_size));
    sor.insert("subjects", "exam:42", json!({"status": "active", "capacity": 30}));
    for id in ["b-1", "b-2", "b-3", "b-4", "b-5"] {
        sor.insert("items", id, json!({"status": "active", "subject": "exam:42"}));
    }
    sor.insert("items", "b-6", json!({"status": "cancelled", "subject": "exam:42"}));
    println!("   └─ exam:42 has {} active bookings", sor.active_count("exam:42"));

    let mirror: Arc<dyn MirrorStore> = match std::env::var("REDIS_URL") {
        Ok(url) => {
            println!("   └─ Mirror: Redis at {}", url);
            Arc::new(RedisMirror::with_prefix(&url, Some("demo:")).await?)
        }
        Err(_) => {
            println!("   └─ Mirror: in-process");
            Arc::new(InMemoryMirror::new())
        }
    };

    let coordinator = BatchCoordinator::new(config, mirror.clone(), sor.clone(), Some(Arc::new(ConsoleWebhook)));

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Mixed batch: active, already cancelled, unknown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Cancelling b-1, b-2, b-3, b-6, b-404...");
    let items: Vec<ItemRef> = ["b-1", "b-2", "b-3", "b-6", "b-404"].into_iter().map(ItemRef::synced).collect();
    let request = MutationRequest::new(items.clone(), Operation::Cancel, "admin@example.com");

    let started = std::time::Instant::now();
    let report = coordinator.apply(request).await?;
    println!("   ⏱️  apply took {:?}", started.elapsed());
    for outcome in &report.outcomes {
        match outcome {
            MutationOutcome::Succeeded { item, state } => println!("   └─ ✅ {} → {}", item, state.status),
            MutationOutcome::Skipped { item, reason } => println!("   └─ ⏭️  {} ({})", item, reason),
            MutationOutcome::Failed { item, code, message } => println!("   └─ ❌ {} {} ({})", item, code, message),
        }
    }
    println!(
        "   HTTP {} · total={} succeeded={} skipped={} failed={}",
        report.http_status(),
        report.summary.total,
        report.summary.succeeded,
        report.summary.skipped,
        report.summary.failed
    );

    // Let the detached notification go out
    coordinator.tasks().drain().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Replay: nothing left to do
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 Replaying the same batch...");
    let replay = coordinator
        .apply(MutationRequest::new(items, Operation::Cancel, "admin@example.com"))
        .await?;
    println!(
        "   └─ succeeded={} skipped={} failed={}",
        replay.summary.succeeded, replay.summary.skipped, replay.summary.failed
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Drift: the mirror loses track, the sweeper puts it back
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🩹 Simulating counter drift...");
    mirror.set_counter("count:exam:42", 9, Duration::from_secs(3600)).await?;
    println!("   └─ mirror says {:?}, SoR says {}", mirror.get_counter("count:exam:42").await?, sor.active_count("exam:42"));

    let sweep = coordinator.sweeper().sweep(coordinator.config().sweep_sample_size).await;
    coordinator.tasks().drain().await;
    println!(
        "   └─ sweep checked={} corrected={} renotified={}",
        sweep.checked, sweep.corrected, sweep.renotified
    );
    println!("   └─ mirror now says {:?}", mirror.get_counter("count:exam:42").await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Dump raw metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    coordinator.shutdown().await;
    let stats = coordinator.tasks().stats();
    println!(
        "   ✅ Background tasks: spawned={} completed={} failed={}",
        stats.spawned, stats.completed, stats.failed
    );

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics, grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters: Vec<(String, String, u64)> = vec![];
    let mut gauges: Vec<(String, String, f64)> = vec![];
    let mut histograms: Vec<(String, String, usize, f64)> = vec![];

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let name = key.name().to_string();

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, samples.len(), sum));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("      └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
