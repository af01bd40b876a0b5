use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::resilience::retry::RetryHint;
use crate::types::FailureCode;

#[derive(Error, Debug, Clone)]
pub enum SorError {
    #[error("SoR rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("SoR transport failure: {0}")]
    Transport(String),
    #[error("SoR returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("SoR response could not be decoded: {0}")]
    Decode(String),
    #[error("SoR circuit open, call not attempted")]
    CircuitOpen,
}

impl SorError {
    /// Code reported for every item of a chunk that ended with this error.
    #[must_use]
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Self::RateLimited { .. } => FailureCode::RateLimited,
            Self::Status { status, .. } if *status < 500 => FailureCode::ProviderRejected,
            _ => FailureCode::Transport,
        }
    }
}

impl RetryHint for SorError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Decode(_) | Self::CircuitOpen => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A row as returned by the SoR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SorRecord {
    pub id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Properties to merge into one SoR row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SorUpdate {
    pub id: String,
    pub properties: Map<String, Value>,
}

/// Per-item error inside an otherwise successful write call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SorItemError {
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// `POST /batch/write` response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkWriteResponse {
    #[serde(default)]
    pub results: Vec<SorRecord>,
    #[serde(default)]
    pub errors: Vec<SorItemError>,
}

/// The only two primitives the engine needs from a system of record.
///
/// Implementations handle a single provider-sized chunk; chunking,
/// parallelism and retries live in [`super::client::SorBatchClient`].
/// Writes must be merges: replaying an update on a row already in that
/// state leaves it unchanged.
#[async_trait]
pub trait SorBackend: Send + Sync {
    async fn batch_read(
        &self,
        object_type: &str,
        ids: &[String],
        fields: &[String],
    ) -> Result<Vec<SorRecord>, SorError>;

    async fn batch_write(
        &self,
        object_type: &str,
        updates: &[SorUpdate],
    ) -> Result<ChunkWriteResponse, SorError>;
}
