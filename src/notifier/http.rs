use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{CountUpdate, NotifyError, WebhookTarget};

/// `POST {subjectId, count, timestamp}` to a fixed URL.
pub struct HttpWebhook {
    client: Client,
    url: String,
    bearer_token: Option<String>,
}

impl HttpWebhook {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, url: url.into(), bearer_token: None })
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl WebhookTarget for HttpWebhook {
    async fn deliver(&self, update: &CountUpdate) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.url).json(update);
        if let Some(ref token) = self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status.as_u16()))
        }
    }
}
