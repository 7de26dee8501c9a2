//! Polling HTTP transport
//!
//! Each exchange posts the outbound message and then polls for the
//! cosigner's reply to the same round:
//!
//! ```text
//! POST {base}/v1/mpc/sessions/{session_id}/messages           body: ProtocolMessage
//! GET  {base}/v1/mpc/sessions/{session_id}/messages/{round}   200: ProtocolMessage
//! ```
//!
//! `202`, `204` and `404` on the poll mean the reply is not there yet.

use super::{Transport, TransportError};
use crate::types::ProtocolMessage;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// HTTP transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    /// Backend URL, without trailing slash
    pub base_url: String,
    /// Delay between reply polls in milliseconds
    pub poll_interval_ms: u64,
    /// Give up after this many pending polls; unbounded when unset
    pub max_polls: Option<u32>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            poll_interval_ms: 500,
            max_polls: None,
            request_timeout_secs: 30,
            auth_token: None,
        }
    }
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = Some(max_polls);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn messages_url(&self, session_id: &str) -> String {
        format!(
            "{}/v1/mpc/sessions/{}/messages",
            self.base_url.trim_end_matches('/'),
            session_id
        )
    }
}

/// Transport polling a cosigner proxy over HTTP
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_message(&self, message: &ProtocolMessage) -> Result<(), TransportError> {
        let url = self.config.messages_url(&message.session_id);
        let response = self
            .authorize(self.client.post(&url).json(message))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(backend_error(status, response).await);
        }
        Ok(())
    }

    async fn poll_reply(&self, session_id: &str, round: u32) -> Result<ProtocolMessage, TransportError> {
        let url = format!("{}/{}", self.config.messages_url(session_id), round);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut polls = 0u32;

        loop {
            let response = self
                .authorize(self.client.get(&url))
                .send()
                .await
                .map_err(|e| TransportError::Network(e.to_string()))?;

            match response.status() {
                StatusCode::OK => {
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| TransportError::Network(e.to_string()))?;
                    return serde_json::from_slice(&body)
                        .map_err(|e| TransportError::MalformedResponse(e.to_string()));
                }
                StatusCode::ACCEPTED | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                    polls += 1;
                    if let Some(max) = self.config.max_polls {
                        if polls >= max {
                            warn!(session_id, round, polls, "Cosigner reply still pending");
                            return Err(TransportError::PollLimitReached(max));
                        }
                    }
                    tokio::time::sleep(interval).await;
                }
                status => return Err(backend_error(status, response).await),
            }
        }
    }
}

async fn backend_error(status: StatusCode, response: reqwest::Response) -> TransportError {
    let message = response.text().await.unwrap_or_default();
    TransportError::Backend {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, message), fields(session_id = %message.session_id, round = message.round))]
    async fn send(&self, message: ProtocolMessage) -> Result<ProtocolMessage, TransportError> {
        self.post_message(&message).await?;
        debug!("Posted protocol message, polling for reply");
        self.poll_reply(&message.session_id, message.round).await
    }
}
