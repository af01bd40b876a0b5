// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SoR batch client: chunk, fan out under a permit budget, settle all.
//!
//! ```text
//!   ids / updates
//!        │  split into provider-sized chunks
//!        ▼
//!   ┌────────┐ ┌────────┐ ┌────────┐
//!   │chunk 0 │ │chunk 1 │ │chunk 2 │   ≤ K in flight (semaphore)
//!   └───┬────┘ └───┬────┘ └───┬────┘   each: retry 429/5xx with backoff
//!       ▼          ▼          ▼
//!   join all, never abort siblings  →  succeeded / rejected / failed
//! ```
//!
//! A chunk that fails after its retries marks only its own items failed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use super::traits::{ChunkWriteResponse, SorBackend, SorError, SorRecord, SorUpdate};
use crate::config::EngineConfig;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::resilience::retry::{retry_when, RetryConfig};
use crate::types::FailureCode;

/// One item that did not make it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub id: String,
    pub code: FailureCode,
    pub message: String,
}

/// Partitioned result of [`SorBatchClient::batch_read`].
#[derive(Debug, Default)]
pub struct ReadResult {
    /// Records the SoR returned, keyed by id. Requested ids missing here are absent.
    pub found: HashMap<String, SorRecord>,
    /// Ids whose chunk could not be read; their state is unknown
    pub failed: Vec<ItemFailure>,
}

impl ReadResult {
    #[must_use]
    pub fn is_unknown(&self, id: &str) -> bool {
        self.failed.iter().any(|f| f.id == id)
    }
}

/// Partitioned result of [`SorBatchClient::batch_write`].
#[derive(Debug, Default)]
pub struct WriteResult {
    pub succeeded: Vec<SorRecord>,
    /// The SoR answered but refused these items
    pub rejected: Vec<ItemFailure>,
    /// The chunk carrying these items never got a usable answer
    pub failed: Vec<ItemFailure>,
}

impl WriteResult {
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.rejected.len() + self.failed.len()
    }
}

pub struct SorBatchClient {
    backend: Arc<dyn SorBackend>,
    chunk_size: usize,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
    circuit: Option<Arc<CircuitBreaker>>,
}

impl SorBatchClient {
    pub fn new(backend: Arc<dyn SorBackend>, config: &EngineConfig) -> Self {
        Self {
            backend,
            chunk_size: config.sor_chunk_size.max(1),
            permits: Arc::new(Semaphore::new(config.sor_concurrency.max(1))),
            retry: config.chunk_retry(),
            circuit: None,
        }
    }

    /// Route every chunk call through a circuit breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit: CircuitBreaker) -> Self {
        self.circuit = Some(Arc::new(circuit));
        self
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[instrument(skip(self, ids, fields), fields(ids = ids.len()))]
    pub async fn batch_read(&self, object_type: &str, ids: &[String], fields: &[String]) -> ReadResult {
        let mut result = ReadResult::default();
        if ids.is_empty() {
            return result;
        }

        let chunks: Vec<Vec<String>> = ids.chunks(self.chunk_size).map(<[String]>::to_vec).collect();
        let fields: Arc<Vec<String>> = Arc::new(fields.to_vec());
        let mut join_set: JoinSet<(usize, Result<Vec<SorRecord>, SorError>)> = JoinSet::new();

        for (index, chunk) in chunks.iter().enumerate() {
            let backend = self.backend.clone();
            let permits = self.permits.clone();
            let circuit = self.circuit.clone();
            let retry = self.retry.clone();
            let object_type = object_type.to_string();
            let chunk = chunk.clone();
            let fields = fields.clone();

            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = retry_when("sor_batch_read", &retry, || {
                    let backend = backend.clone();
                    let circuit = circuit.clone();
                    let object_type = object_type.clone();
                    let chunk = chunk.clone();
                    let fields = fields.clone();
                    async move {
                        guarded(circuit.as_deref(), || async move {
                            backend.batch_read(&object_type, &chunk, &fields).await
                        })
                        .await
                    }
                })
                .await;
                (index, outcome)
            });
        }

        let mut settled: HashSet<usize> = HashSet::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((index, outcome)) = joined else { continue };
            settled.insert(index);
            match outcome {
                Ok(records) => {
                    crate::metrics::record_chunk("read", "success");
                    for record in records {
                        result.found.insert(record.id.clone(), record);
                    }
                }
                Err(err) => {
                    warn!(chunk = index, items = chunks[index].len(), error = %err, "SoR read chunk failed");
                    crate::metrics::record_chunk("read", "failed");
                    result.failed.extend(fail_all(&chunks[index], &err));
                }
            }
        }
        fail_unsettled(&chunks, &settled, &mut result.failed);

        debug!(found = result.found.len(), failed = result.failed.len(), "SoR batch read settled");
        result
    }

    #[instrument(skip(self, updates), fields(updates = updates.len()))]
    pub async fn batch_write(&self, object_type: &str, updates: Vec<SorUpdate>) -> WriteResult {
        let mut result = WriteResult::default();
        if updates.is_empty() {
            return result;
        }

        let chunks: Vec<Vec<SorUpdate>> = updates.chunks(self.chunk_size).map(<[SorUpdate]>::to_vec).collect();
        let chunk_ids: Vec<Vec<String>> = chunks
            .iter()
            .map(|c| c.iter().map(|u| u.id.clone()).collect())
            .collect();
        let mut join_set: JoinSet<(usize, Result<ChunkWriteResponse, SorError>)> = JoinSet::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let backend = self.backend.clone();
            let permits = self.permits.clone();
            let circuit = self.circuit.clone();
            let retry = self.retry.clone();
            let object_type = object_type.to_string();
            let chunk = Arc::new(chunk);

            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                // Writes are merges of target state, so replaying a chunk is safe.
                let outcome = retry_when("sor_batch_write", &retry, || {
                    let backend = backend.clone();
                    let circuit = circuit.clone();
                    let object_type = object_type.clone();
                    let chunk = chunk.clone();
                    async move {
                        guarded(circuit.as_deref(), || async move {
                            backend.batch_write(&object_type, &chunk).await
                        })
                        .await
                    }
                })
                .await;
                (index, outcome)
            });
        }

        let mut settled: HashSet<usize> = HashSet::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((index, outcome)) = joined else { continue };
            settled.insert(index);
            let ids = &chunk_ids[index];
            match outcome {
                Ok(response) => {
                    crate::metrics::record_chunk("write", "success");
                    absorb_write_response(ids, response, &mut result);
                }
                Err(err) => {
                    warn!(chunk = index, items = ids.len(), error = %err, "SoR write chunk failed");
                    crate::metrics::record_chunk("write", "failed");
                    if matches!(err, SorError::RateLimited { .. }) {
                        crate::metrics::record_rate_limit_exhausted();
                    }
                    result.failed.extend(fail_all(ids, &err));
                }
            }
        }
        fail_unsettled(&chunk_ids, &settled, &mut result.failed);

        debug!(
            succeeded = result.succeeded.len(),
            rejected = result.rejected.len(),
            failed = result.failed.len(),
            "SoR batch write settled"
        );
        result
    }
}

async fn guarded<F, Fut, T>(circuit: Option<&CircuitBreaker>, call: F) -> Result<T, SorError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, SorError>>,
{
    match circuit {
        None => call().await,
        Some(cb) => cb.call(call).await.map_err(|e| match e {
            CircuitError::Rejected => SorError::CircuitOpen,
            CircuitError::Inner(inner) => inner,
        }),
    }
}

fn fail_all(ids: &[String], err: &SorError) -> Vec<ItemFailure> {
    let code = err.failure_code();
    ids.iter()
        .map(|id| ItemFailure { id: id.clone(), code, message: err.to_string() })
        .collect()
}

/// Chunks whose task died without reporting still owe their items an outcome.
fn fail_unsettled(chunks: &[Vec<String>], settled: &HashSet<usize>, failed: &mut Vec<ItemFailure>) {
    for (index, ids) in chunks.iter().enumerate() {
        if !settled.contains(&index) {
            warn!(chunk = index, items = ids.len(), "SoR chunk task aborted");
            failed.extend(ids.iter().map(|id| ItemFailure {
                id: id.clone(),
                code: FailureCode::Transport,
                message: "chunk task aborted".into(),
            }));
        }
    }
}

/// Every id of the chunk lands in exactly one bucket.
fn absorb_write_response(ids: &[String], response: ChunkWriteResponse, result: &mut WriteResult) {
    let mut pending: HashSet<&str> = ids.iter().map(String::as_str).collect();

    for record in response.results {
        if pending.remove(record.id.as_str()) {
            result.succeeded.push(record);
        }
    }
    for error in response.errors {
        if pending.remove(error.id.as_str()) {
            let code = match error.code.as_str() {
                "NOT_FOUND" | "OBJECT_NOT_FOUND" => FailureCode::NotFound,
                _ => FailureCode::ProviderRejected,
            };
            result.rejected.push(ItemFailure { id: error.id, code, message: error.message });
        }
    }
    for id in ids.iter().filter(|id| pending.contains(id.as_str())) {
        result.failed.push(ItemFailure {
            id: id.clone(),
            code: FailureCode::Transport,
            message: "missing from SoR write response".into(),
        });
    }
}
