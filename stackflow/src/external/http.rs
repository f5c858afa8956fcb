//! A worker reached over HTTP.

use super::{Worker, WorkerRequest, WorkerResponse};
use crate::errors::WorkerError;
use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// POSTs each request as JSON and decodes the JSON answer.
///
/// 2xx bodies are decoded as a [`WorkerResponse`]. 408, 429 and 5xx are
/// transient, any other status is permanent, and a request that outlives the
/// timeout is a `Timeout`.
#[derive(Debug, Clone)]
pub struct HttpWorker {
    client: Client,
    url: String,
    timeout: Duration,
    bearer_token: Option<String>,
}

impl HttpWorker {
    /// Creates a worker posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            timeout,
            bearer_token: None,
        })
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// Maps a non-success status to a worker error.
fn classify_status(status: StatusCode, body: &str) -> WorkerError {
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        WorkerError::Transient(detail)
    } else {
        WorkerError::Permanent(detail)
    }
}

#[async_trait]
impl Worker for HttpWorker {
    async fn invoke(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &request.idempotency_token)
            .json(request);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                WorkerError::Timeout {
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                }
            } else {
                WorkerError::Transient(format!("request failed: {err}"))
            }
        })?;

        let status = response.status();
        debug!(logical_id = %request.logical_id, status = %status, "Worker answered");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<WorkerResponse>()
            .await
            .map_err(|err| WorkerError::Permanent(format!("malformed worker response: {err}")))
    }
}
