//! Collector client: the component that actually delivers envelopes.
//!
//! The transport only talks to the [`CollectorClient`] trait. [`HecClient`] is
//! the default implementation, a thin HTTP client for the Splunk HTTP Event
//! Collector. It makes exactly one request per send; retrying is left to
//! whoever wraps or replaces it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Config, ConfigError};
use crate::record::EventEnvelope;

/// HTTP request timeout for a single send.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Errors reported by a collector client for a failed send.
///
/// Cloneable so one failure can be handed to every callback of a batch as
/// well as to the notification channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Collector rejected events (code {code}): {text}")]
    Rejected { code: i64, text: String },

    #[error("Failed to serialize events: {0}")]
    Serialize(String),

    #[error("Failed to parse collector response: {0}")]
    Parse(String),

    #[error("Transport has been closed")]
    Closed,
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Timeout
        } else {
            DeliveryError::Request(err.to_string())
        }
    }
}

/// Delivers batches of envelopes to the collector.
#[async_trait]
pub trait CollectorClient: Send + Sync {
    /// Send one or more envelopes as a single delivery.
    async fn send(&self, envelopes: Vec<EventEnvelope>) -> Result<(), DeliveryError>;
}

/// Body returned by the HTTP Event Collector.
#[derive(Debug, Clone, Deserialize)]
pub struct HecResponse {
    #[serde(default)]
    pub text: String,

    /// 0 on success
    #[serde(default)]
    pub code: i64,
}

/// HTTP Event Collector client.
///
/// # Example
///
/// ```no_run
/// use splunk_transport::client::{CollectorClient, HecClient};
/// use splunk_transport::config::{resolve, SplunkSettings, TransportOptions};
///
/// #[tokio::main]
/// async fn main() {
///     let options = TransportOptions::with_settings(SplunkSettings::with_token("token"));
///     let resolved = resolve(Some(&options)).expect("invalid options");
///     let client = HecClient::new(&resolved.config).expect("Failed to create client");
///
///     client.send(Vec::new()).await.ok();
/// }
/// ```
pub struct HecClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Full URL of the event endpoint
    url: String,

    token: String,
}

impl HecClient {
    /// Create a client bound to the host, port and token in `config`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Client` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Self::with_url(config.url(), config.token.clone())
    }

    /// Create a client for an explicit endpoint URL.
    pub fn with_url(url: impl Into<String>, token: impl Into<String>) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            token: token.into(),
        })
    }

    /// Get the configured endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CollectorClient for HecClient {
    async fn send(&self, envelopes: Vec<EventEnvelope>) -> Result<(), DeliveryError> {
        let count = envelopes.len();
        let body = encode(&envelopes)?;

        debug!(count = count, url = %self.url, "Sending events to collector");

        let response = self
            .client
            .post(&self.url)
            .header(AUTHORIZATION, format!("Splunk {}", self.token))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "Collector returned an error status");
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                message: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(());
        }

        let reply: HecResponse =
            serde_json::from_str(&text).map_err(|e| DeliveryError::Parse(e.to_string()))?;
        if reply.code != 0 {
            return Err(DeliveryError::Rejected {
                code: reply.code,
                text: reply.text,
            });
        }

        Ok(())
    }
}

/// Serialize envelopes as newline-separated JSON objects, the batch format the
/// collector accepts on its event endpoint.
fn encode(envelopes: &[EventEnvelope]) -> Result<String, DeliveryError> {
    let mut body = String::new();
    for envelope in envelopes {
        let line =
            serde_json::to_string(envelope).map_err(|e| DeliveryError::Serialize(e.to_string()))?;
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&line);
    }
    Ok(body)
}
