//! HTTP system-of-record backend.
//!
//! ```text
//! POST {base}/{type}/batch/read   {"ids": [...], "fields": [...]}  -> {"results": [...]}
//! POST {base}/{type}/batch/write  {"updates": [...]}               -> {"results": [...], "errors": [...]}
//! ```
//!
//! A 429 carries an optional `Retry-After` (seconds) that the batch client
//! folds into its backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{ChunkWriteResponse, SorBackend, SorError, SorRecord, SorUpdate};

#[derive(Serialize)]
struct ReadBody<'a> {
    ids: &'a [String],
    fields: &'a [String],
}

#[derive(Deserialize)]
struct ReadResponse {
    #[serde(default)]
    results: Vec<SorRecord>,
}

#[derive(Serialize)]
struct WriteBody<'a> {
    updates: &'a [SorUpdate],
}

pub struct HttpSor {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpSor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SorError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
        })
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn url(&self, object_type: &str, op: &str) -> String {
        format!("{}/{}/batch/{}", self.base_url, object_type, op)
    }

    async fn post<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<Response, SorError> {
        let mut request = self.client.post(url).json(body);
        if let Some(ref token) = self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SorError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            debug!(url = %url, ?retry_after, "SoR throttled request");
            return Err(SorError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SorError::Status { status: status.as_u16(), body });
        }

        Ok(response)
    }
}

#[async_trait]
impl SorBackend for HttpSor {
    async fn batch_read(
        &self,
        object_type: &str,
        ids: &[String],
        fields: &[String],
    ) -> Result<Vec<SorRecord>, SorError> {
        let response = self
            .post(&self.url(object_type, "read"), &ReadBody { ids, fields })
            .await?;

        let body: ReadResponse = response
            .json()
            .await
            .map_err(|e| SorError::Decode(e.to_string()))?;
        Ok(body.results)
    }

    async fn batch_write(
        &self,
        object_type: &str,
        updates: &[SorUpdate],
    ) -> Result<ChunkWriteResponse, SorError> {
        let response = self
            .post(&self.url(object_type, "write"), &WriteBody { updates })
            .await?;

        response
            .json()
            .await
            .map_err(|e| SorError::Decode(e.to_string()))
    }
}
