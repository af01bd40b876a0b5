//! # Batch Sync Engine
//!
//! Applies bulk state changes (cancel N bookings, mark attendance, adjust
//! capacity counters) against a remote, rate-limited system of record (SoR)
//! while keeping a local mirror of records and counters within a bounded
//! staleness window.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   BatchCoordinator::apply                   │
//! │  • validates shape and size (≤ max_batch_size)             │
//! │  • one outcome per item, partial success is normal         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    IdempotencyFilter                        │
//! │  • mirror first, SoR read-through on miss                  │
//! │  • static transition table: Proceed / Skip / Reject        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (synced items)  │  (local-only items → mirror)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SorBatchClient                          │
//! │  • provider-sized chunks, ≤ K in flight                    │
//! │  • 429 / 5xx retried per chunk with backoff                │
//! │  • settle all: one failed chunk never aborts the others    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  MirrorStore (DashMap / Redis)   InvalidationPropagator     │
//! │  • records + clamped counters    • static view patterns    │
//! │                                                             │
//! │  SyncNotifier (detached)         ReconciliationSweeper      │
//! │  • one push per subject          • samples, corrects drift │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use batch_sync_engine::{BatchCoordinator, EngineConfig, ItemRef, MutationRequest, Operation};
//! use batch_sync_engine::sor::memory::InMemorySor;
//! use batch_sync_engine::storage::memory::InMemoryMirror;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::default();
//!     let sor = Arc::new(InMemorySor::new(config.sor_chunk_size));
//!     sor.insert("items", "b-1", serde_json::json!({"status": "active", "subject": "exam:42"}));
//!
//!     let coordinator = BatchCoordinator::new(config, Arc::new(InMemoryMirror::new()), sor, None);
//!     let report = coordinator
//!         .apply(MutationRequest::new(vec![ItemRef::synced("b-1")], Operation::Cancel, "admin"))
//!         .await
//!         .expect("valid request");
//!
//!     assert_eq!(report.summary.succeeded, 1);
//!     coordinator.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: [`BatchCoordinator`], the only entry point for mutations
//! - [`filter`]: transition table and idempotency filter
//! - [`sor`]: SoR primitives, HTTP and in-memory backends, chunking client
//! - [`storage`]: mirror store trait, DashMap and Redis backends
//! - [`invalidation`]: entity to cache-pattern mapping
//! - [`notifier`]: downstream count webhook with retries
//! - [`sweeper`]: drift reconciliation
//! - [`tasks`]: bounded detached-task runner
//! - [`resilience`]: retry with backoff, circuit breaker

pub mod config;
pub mod types;
pub mod keys;
pub mod storage;
pub mod sor;
pub mod filter;
pub mod invalidation;
pub mod notifier;
pub mod tasks;
pub mod coordinator;
pub mod sweeper;
pub mod resilience;
pub mod metrics;

pub use config::EngineConfig;
pub use types::{FailureCode, ItemRef, ItemState, ItemStatus, MutationOutcome, MutationRequest, Operation, OperationKind};
pub use coordinator::{ApplyReport, BatchCoordinator, MutationError, SetupError, Summary};
pub use filter::{classify, Decision, IdempotencyFilter};
pub use invalidation::{Entity, InvalidationPropagator, InvalidationSet};
pub use notifier::{CountUpdate, HttpWebhook, NotifyOutcome, SyncNotifier, WebhookTarget};
pub use sor::client::SorBatchClient;
pub use sor::traits::{SorBackend, SorError};
pub use storage::traits::{MirrorError, MirrorStore};
pub use sweeper::{ReconciliationSweeper, SweepReport};
pub use tasks::BackgroundTasks;
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitStats};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
