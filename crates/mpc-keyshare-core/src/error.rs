//! Error types for key-share protocol and storage operations

use crate::engine::EngineError;
use crate::storage::StorageStatus;
use crate::transport::TransportError;
use crate::types::Algorithm;
use thiserror::Error;

/// Result type alias for key-share operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during key-share operations
#[derive(Debug, Error)]
pub enum Error {
    // ============ Configuration Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Public key is not valid hex or has an unexpected encoding
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    // ============ Storage Errors ============
    /// The platform secure storage rejected an operation
    #[error("Storage failure ({status}): {context}")]
    StorageFailure {
        status: StorageStatus,
        context: String,
    },

    /// Key share not found for a profile that must have one
    #[error("Key share not found: {0}")]
    KeyShareNotFound(String),

    /// A wallet already exists for this profile
    #[error("Wallet already exists for profile {0}")]
    WalletAlreadyExists(String),

    /// Stored share was generated for another algorithm
    #[error("Algorithm mismatch: stored share is {actual}, requested {expected}")]
    AlgorithmMismatch {
        expected: Algorithm,
        actual: Algorithm,
    },

    /// User presence check was cancelled or failed
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    // ============ Cryptographic Errors ============
    /// Sealing a payload failed
    #[error("Encryption failure: {0}")]
    EncryptionFailure(String),

    /// Stored payload could not be opened (corruption or key loss)
    #[error("Decryption failure: {0}")]
    DecryptionFailure(String),

    // ============ Network/Protocol Errors ============
    /// Transport adapter failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Counterparty is ahead of the local round counter
    #[error("Protocol desync in session {session_id}: expected round {expected}, got {received}")]
    ProtocolDesync {
        session_id: String,
        expected: u32,
        received: u32,
    },

    /// The engine rejected a counterparty message (proof or commitment failure)
    #[error("Protocol message rejected: {0}")]
    ProtocolRejected(String),

    /// Message could not be parsed or does not belong to the session
    #[error("Malformed protocol message: {0}")]
    MalformedMessage(String),

    /// Another exclusive session is running for the profile
    #[error("Session conflict for profile {profile_id}: session {active} is still active")]
    SessionConflict { profile_id: String, active: String },

    /// Session was cancelled or released while in progress
    #[error("Session cancelled: {0}")]
    SessionCancelled(String),

    // ============ Session Outcomes ============
    /// Key generation session failed
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(#[source] Box<Error>),

    /// Key rotation session failed
    #[error("Key rotation failed: {0}")]
    KeyRotationFailed(#[source] Box<Error>),

    /// Signing session failed
    #[error("Signing failed: {0}")]
    SigningFailed(#[source] Box<Error>),

    // ============ Serialization Errors ============
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // ============ Internal Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a storage failure from a platform status
    pub fn storage(status: StorageStatus, context: impl Into<String>) -> Self {
        Error::StorageFailure {
            status,
            context: context.into(),
        }
    }

    /// Innermost error for session-outcome wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::KeyGenerationFailed(inner)
            | Error::KeyRotationFailed(inner)
            | Error::SigningFailed(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Whether a caller may reasonably retry by starting a new session
    pub fn is_retryable(&self) -> bool {
        match self.root_cause() {
            Error::Transport(e) => e.is_retryable(),
            Error::SessionConflict { .. } => true,
            _ => false,
        }
    }

    /// Payload reachable but unreadable: corruption or key loss
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self.root_cause(), Error::DecryptionFailure(_))
    }
}

impl From<EngineError> for Error {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Rejected(reason) => Error::ProtocolRejected(reason),
            EngineError::Malformed(reason) => Error::MalformedMessage(reason),
            EngineError::Internal(reason) => Error::Internal(reason),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Deserialization(e.to_string())
    }
}
