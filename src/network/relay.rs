//! Signaling relay client
//!
//! The relay is a store-and-forward queue keyed by client id. Enqueue posts a
//! handshake message; dequeue returns either the next pending message or a
//! server-chosen retry delay.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::error::NetworkError;
use super::signaling::{ClientId, HandshakeMessage};

/// Default relay base URL
pub const DEFAULT_RELAY_URL: &str = "http://slime.glenwatson.me";

/// Default connect timeout for relay requests
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a single dequeue request
#[derive(Debug, Clone, PartialEq)]
pub enum RelayResponse {
    /// Nothing queued yet; ask again after the given delay
    Retry(Duration),
    /// The next queued handshake message
    Message(HandshakeMessage),
    /// Empty body
    Empty,
}

impl RelayResponse {
    /// Parse a dequeue response body.
    ///
    /// `{"retry": <ms>}` with a positive delay (number or numeric string) is
    /// a backoff instruction. A `retry` of zero or anything unusable carries
    /// neither backoff nor a handshake and parses as an unrecognized message.
    /// Any other object must be a handshake message.
    pub fn parse(body: &str) -> Result<Self, NetworkError> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(Self::Empty);
        }

        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| NetworkError::MalformedRelayPayload(e.to_string()))?;

        if let Some(retry) = value.get("retry") {
            return Ok(match retry_delay(retry) {
                Some(delay) => Self::Retry(delay),
                None => Self::Message(HandshakeMessage::Unrecognized),
            });
        }

        serde_json::from_value(value)
            .map(Self::Message)
            .map_err(|e| NetworkError::MalformedRelayPayload(e.to_string()))
    }
}

fn retry_delay(retry: &serde_json::Value) -> Option<Duration> {
    let ms = match retry {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        other => other.as_f64()?,
    };
    if ms > 0.0 {
        Duration::try_from_secs_f64(ms / 1000.0).ok()
    } else {
        None
    }
}

/// Enqueue/dequeue access to the relay
#[async_trait]
pub trait Relay: Send + Sync {
    /// Enqueue a message under `client_id`
    async fn post(&self, client_id: &ClientId, message: &HandshakeMessage)
        -> Result<(), NetworkError>;

    /// Dequeue the next message pending for `client_id`
    async fn fetch(&self, client_id: &ClientId) -> Result<RelayResponse, NetworkError>;
}

/// Relay client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Base URL the `serverPost.php` / `serverGet.php` endpoints live under
    pub base_url: String,
    /// Upper bound on a single request, including the response body
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_RELAY_URL.to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP relay client
#[derive(Debug, Clone)]
pub struct HttpRelay {
    http: Client,
    base_url: String,
}

impl HttpRelay {
    pub fn new(config: RelayConfig) -> Result<Self, NetworkError> {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| NetworkError::RelayUnreachable(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, script: &str) -> String {
        format!("{}/{}", self.base_url, script)
    }

    async fn call(
        &self,
        script: &str,
        client_id: &ClientId,
        body: Option<String>,
    ) -> Result<String, NetworkError> {
        let mut req = self
            .http
            .post(self.endpoint(script))
            .query(&[("unique", client_id.as_str())]);
        if let Some(body) = body {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                NetworkError::RelayUnreachable("request timed out".to_string())
            } else {
                NetworkError::RelayUnreachable(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            warn!("Relay {} answered HTTP {}", script, status.as_u16());
            return Err(NetworkError::RelayRejected {
                status: status.as_u16(),
            });
        }

        resp.text()
            .await
            .map_err(|e| NetworkError::RelayUnreachable(e.to_string()))
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn post(
        &self,
        client_id: &ClientId,
        message: &HandshakeMessage,
    ) -> Result<(), NetworkError> {
        let json = serde_json::to_string(message)?;
        debug!("Posting {} for {}", message.kind(), client_id);
        self.call("serverPost.php", client_id, Some(json)).await?;
        Ok(())
    }

    async fn fetch(&self, client_id: &ClientId) -> Result<RelayResponse, NetworkError> {
        let body = self.call("serverGet.php", client_id, None).await?;
        trace!("Relay returned {} bytes for {}", body.len(), client_id);
        RelayResponse::parse(&body)
    }
}
