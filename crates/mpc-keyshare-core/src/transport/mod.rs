//! Transport to the cosigner backend
//!
//! Protocol messages travel as request/response exchanges: each call sends
//! the local party's message for one round and resolves with the
//! counterparty's message for the same round. Re-sending a message for a
//! `(session_id, round)` pair must be idempotent on the backend.

use crate::types::ProtocolMessage;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{HttpTransport, HttpTransportConfig};

/// Transport failures, kept apart from protocol and crypto errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection, DNS or TLS failure
    #[error("Network error: {0}")]
    Network(String),

    /// Backend answered with an error status
    #[error("Backend returned status {status}: {message}")]
    Backend { status: u16, message: String },

    /// Backend answered 200 with a body that is not a protocol message
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Reply still pending after the configured number of polls
    #[error("No reply after {0} polls")]
    PollLimitReached(u32),

    /// Transport was shut down
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::PollLimitReached(_) => true,
            TransportError::Backend { status, .. } => *status == 429 || *status >= 500,
            TransportError::MalformedResponse(_) | TransportError::Closed => false,
        }
    }
}

/// Request/response channel to the cosigner
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` and wait for the counterparty's reply
    async fn send(&self, message: ProtocolMessage) -> Result<ProtocolMessage, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, message: ProtocolMessage) -> Result<ProtocolMessage, TransportError> {
        (**self).send(message).await
    }
}
