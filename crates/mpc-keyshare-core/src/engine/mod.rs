//! Threshold protocol engine seam
//!
//! The session manager never inspects protocol payloads. It hands each
//! counterparty message to an [`EngineSession`] and forwards whatever the
//! engine produces next, until the engine reports a finished result.
//!
//! A production deployment plugs a two-party ECDSA/EdDSA implementation in
//! behind [`ProtocolEngine`]. [`loopback`] provides a small secp256k1 Schnorr
//! engine and [`cosigner`] its remote counterpart, so the whole orchestration
//! can run in-process.

use crate::types::{Algorithm, KeyShare, SessionId};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

pub mod cosigner;
pub mod loopback;
pub(crate) mod schnorr;

pub use cosigner::{CosignerFault, LoopbackCosigner};
pub use loopback::LoopbackEngine;

/// Engine failure while starting or advancing a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Counterparty failed a proof, commitment or consistency check
    #[error("rejected: {0}")]
    Rejected(String),

    /// Payload could not be decoded
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("engine failure: {0}")]
    Internal(String),
}

/// What an engine produced after consuming a counterparty message
#[derive(Debug)]
pub enum RoundOutcome<T> {
    /// Outbound payload for the next round
    Continue(Vec<u8>),
    /// The protocol finished
    Finished(T),
}

/// Result of a key generation or rotation run
pub struct KeyMaterial {
    /// Opaque local share, persisted encrypted
    pub share_data: Zeroizing<Vec<u8>>,
    /// Combined public key bytes
    pub public_key: Vec<u8>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("share_data", &"[REDACTED]")
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

/// Result of a signing run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureOutput {
    pub bytes: Vec<u8>,
}

/// Per-session engine state
///
/// Calls for one session are never concurrent. `release` is called exactly
/// once when the session leaves the registry, whatever the outcome.
pub trait EngineSession: Send {
    type Output;

    /// Payload of the first outbound message
    fn initial_message(&mut self) -> Result<Vec<u8>, EngineError>;

    /// Consume the counterparty's message for `round`
    fn process(&mut self, round: u32, payload: &[u8])
        -> Result<RoundOutcome<Self::Output>, EngineError>;

    /// Drop secret intermediate state
    fn release(&mut self);
}

/// Typed engine handle held by a session
pub enum EngineHandle {
    KeyGen(Box<dyn EngineSession<Output = KeyMaterial>>),
    Sign(Box<dyn EngineSession<Output = SignatureOutput>>),
}

impl EngineHandle {
    pub fn release(&mut self) {
        match self {
            EngineHandle::KeyGen(session) => session.release(),
            EngineHandle::Sign(session) => session.release(),
        }
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineHandle::KeyGen(_) => f.write_str("EngineHandle::KeyGen"),
            EngineHandle::Sign(_) => f.write_str("EngineHandle::Sign"),
        }
    }
}

/// Factory for engine sessions
pub trait ProtocolEngine: Send + Sync {
    /// Start distributed key generation with the cosigner identified by
    /// `cloud_public_key`
    fn keygen(
        &self,
        algorithm: Algorithm,
        cloud_public_key: &[u8],
        session_id: &SessionId,
    ) -> Result<Box<dyn EngineSession<Output = KeyMaterial>>, EngineError>;

    /// Start a rotation replacing `current`
    ///
    /// Engines that can refresh shares override this and keep the joint
    /// public key; the default runs a fresh key generation.
    fn rotation(
        &self,
        current: &KeyShare,
        cloud_public_key: &[u8],
        session_id: &SessionId,
    ) -> Result<Box<dyn EngineSession<Output = KeyMaterial>>, EngineError> {
        self.keygen(current.algorithm, cloud_public_key, session_id)
    }

    /// Start signing the 32-byte `digest` with `share`
    fn signing(
        &self,
        share: &KeyShare,
        digest: &[u8; 32],
        session_id: &SessionId,
    ) -> Result<Box<dyn EngineSession<Output = SignatureOutput>>, EngineError>;
}
