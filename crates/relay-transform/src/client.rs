//! ---
//! relay_section: "05-networking-external-interfaces"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Transform client and transformer HTTP service."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relay_metrics::{fallback_reason, RelayMetrics};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::payload_text;

/// Failure of a single transform attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// No complete response within the allotted time.
    #[error("transform timed out after {0:?}")]
    Timeout(Duration),
    /// Connection, TLS or protocol failure.
    #[error("transform request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Transformer answered with a non-success status.
    #[error("transformer returned status {0}")]
    Status(u16),
    /// Response body was not a JSON object.
    #[error("malformed transform response: {0}")]
    Decode(String),
}

impl TransformError {
    /// Metric label for this failure kind.
    pub fn reason(&self) -> &'static str {
        match self {
            TransformError::Timeout(_) => fallback_reason::TIMEOUT,
            TransformError::Transport(_) => fallback_reason::TRANSPORT,
            TransformError::Status(_) => fallback_reason::STATUS,
            TransformError::Decode(_) => fallback_reason::DECODE,
        }
    }
}

/// Best-effort text rewrite used by the relay.
///
/// Implementations never fail: whatever goes wrong, the caller gets text back
/// within roughly `timeout`.
#[async_trait]
pub trait PayloadTransform: Send + Sync + 'static {
    /// Transform `payload`, returning it unchanged when the rewrite is unavailable.
    async fn transform(&self, payload: &str, timeout: Duration) -> String;
}

/// Identity transform, for running the relay without a transformer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl PayloadTransform for Passthrough {
    async fn transform(&self, payload: &str, _timeout: Duration) -> String {
        payload.to_owned()
    }
}

/// HTTP client for a remote `/transform` endpoint.
#[derive(Clone)]
pub struct TransformClient {
    http: Client,
    url: String,
    metrics: Option<RelayMetrics>,
}

impl TransformClient {
    /// Client posting to `url`, e.g. `http://transformer:8000/transform`.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_http_client(Client::new(), url)
    }

    /// Reuse an existing connection pool.
    pub fn with_http_client(http: Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            metrics: None,
        }
    }

    /// Record latency and fallbacks into relay metrics.
    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Endpoint this client posts to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// One attempt, surfacing the failure instead of falling back.
    ///
    /// A response object without a `payload` field yields the original text.
    pub async fn try_transform(
        &self,
        payload: &str,
        timeout: Duration,
    ) -> Result<String, TransformError> {
        match tokio::time::timeout(timeout, self.post(payload)).await {
            Ok(result) => result,
            Err(_) => Err(TransformError::Timeout(timeout)),
        }
    }

    async fn post(&self, payload: &str) -> Result<String, TransformError> {
        let response = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "payload": payload }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransformError::Status(status.as_u16()));
        }
        let bytes = response.bytes().await?;
        let body: Value =
            serde_json::from_slice(&bytes).map_err(|err| TransformError::Decode(err.to_string()))?;
        let Value::Object(fields) = body else {
            return Err(TransformError::Decode("expected a JSON object".into()));
        };
        Ok(fields
            .get("payload")
            .map(payload_text)
            .unwrap_or_else(|| payload.to_owned()))
    }
}

#[async_trait]
impl PayloadTransform for TransformClient {
    async fn transform(&self, payload: &str, timeout: Duration) -> String {
        let started = Instant::now();
        let outcome = self.try_transform(payload, timeout).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_transform(started.elapsed());
        }
        match outcome {
            Ok(transformed) => {
                debug!(url = %self.url, "payload transformed");
                transformed
            }
            Err(err) => {
                warn!(url = %self.url, error = %err, "transform failed, forwarding original payload");
                if let Some(metrics) = &self.metrics {
                    metrics.record_fallback(err.reason());
                }
                payload.to_owned()
            }
        }
    }
}
