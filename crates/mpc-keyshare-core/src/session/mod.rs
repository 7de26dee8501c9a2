//! MPC Session Manager
//!
//! Drives keygen, rotation and signing sessions round by round:
//!
//! 1. register the session (keygen and rotation are exclusive per profile)
//! 2. send the engine's outbound message through the [`Transport`]
//! 3. feed the reply to the engine under the registry lock
//! 4. repeat until the engine reports a result
//!
//! A session leaves the registry when it completes, fails, is cancelled or
//! its driving future is dropped. Nothing is persisted here.

use crate::engine::{EngineHandle, ProtocolEngine};
use crate::transport::Transport;
use crate::types::{Algorithm, KeyShare, ProtocolMessage, SessionId, SessionKind, Signature};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

mod registry;
pub mod state;

use registry::SessionRegistry;
pub use state::{Advance, MpcSession, SessionOutput, SessionState};

/// Session manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    /// Consecutive stale replies tolerated before the session fails
    pub max_stale_messages: u32,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_stale_messages: 3,
        }
    }
}

impl SessionManagerConfig {
    pub fn with_max_stale_messages(mut self, max: u32) -> Self {
        self.max_stale_messages = max;
        self
    }
}

/// Owns every active protocol session
pub struct SessionManager {
    engine: Arc<dyn ProtocolEngine>,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    config: SessionManagerConfig,
}

/// Removes the session however the driving future ends
struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(mut session) = self.registry.remove(&self.id) {
            if !session.state().is_terminal() {
                debug!(session_id = %self.id, "Session abandoned before completion");
                session.fail();
            }
        }
    }
}

impl SessionManager {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        transport: Arc<dyn Transport>,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            engine,
            transport,
            registry: Arc::new(SessionRegistry::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// Run distributed key generation for `profile_id`
    ///
    /// The returned share is not persisted.
    #[instrument(skip(self, cloud_public_key))]
    pub async fn begin_key_generation(
        &self,
        algorithm: Algorithm,
        cloud_public_key: &[u8],
        profile_id: &str,
    ) -> Result<KeyShare> {
        let session_id = new_session_id();
        let result: Result<KeyShare> = async {
            let engine = self.engine.keygen(algorithm, cloud_public_key, &session_id)?;
            let output = self
                .drive(
                    session_id.clone(),
                    SessionKind::KeyGeneration,
                    Some(profile_id),
                    EngineHandle::KeyGen(engine),
                )
                .await?;
            key_share_from(output, algorithm)
        }
        .await;

        match result {
            Ok(share) => {
                info!(session_id = %session_id, key_id = %share.key_id, address = %share.address, "Key generation completed");
                Ok(share)
            }
            Err(e) => Err(wrap_failure(e, Error::KeyGenerationFailed)),
        }
    }

    /// Rotate `current` into a new share under a `KeyRotation` session
    #[instrument(skip(self, current, cloud_public_key), fields(key_id = %current.key_id))]
    pub async fn begin_key_rotation(
        &self,
        current: &KeyShare,
        cloud_public_key: &[u8],
        profile_id: &str,
    ) -> Result<KeyShare> {
        let session_id = new_session_id();
        let algorithm = current.algorithm;
        let result: Result<KeyShare> = async {
            let engine = self.engine.rotation(current, cloud_public_key, &session_id)?;
            let output = self
                .drive(
                    session_id.clone(),
                    SessionKind::KeyRotation,
                    Some(profile_id),
                    EngineHandle::KeyGen(engine),
                )
                .await?;
            key_share_from(output, algorithm)
        }
        .await;

        match result {
            Ok(share) => {
                info!(session_id = %session_id, new_key_id = %share.key_id, "Key rotation completed");
                Ok(share)
            }
            Err(e) => Err(wrap_failure(e, Error::KeyRotationFailed)),
        }
    }

    /// Jointly sign a 32-byte digest with `share`
    #[instrument(skip(self, share, digest), fields(key_id = %share.key_id))]
    pub async fn begin_signing(&self, share: &KeyShare, digest: &[u8; 32]) -> Result<Signature> {
        let session_id = new_session_id();
        let result: Result<Signature> = async {
            let engine = self.engine.signing(share, digest, &session_id)?;
            let output = self
                .drive(
                    session_id.clone(),
                    SessionKind::Signing,
                    None,
                    EngineHandle::Sign(engine),
                )
                .await?;
            match output {
                SessionOutput::Signature(signature) => {
                    Ok(Signature::new(share.algorithm, signature.bytes))
                }
                SessionOutput::KeyMaterial(_) => Err(Error::Internal(
                    "signing session produced key material".into(),
                )),
            }
        }
        .await;

        match result {
            Ok(signature) => {
                info!(session_id = %session_id, "Signing completed");
                Ok(signature)
            }
            Err(e) => Err(wrap_failure(e, Error::SigningFailed)),
        }
    }

    /// Fail and release a running session; unknown ids are ignored
    pub fn cancel_session(&self, session_id: &str) -> bool {
        let cancelled = self.registry.cancel(session_id);
        if cancelled {
            info!(session_id = %session_id, "Session cancelled");
        }
        cancelled
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.registry.state(session_id)
    }

    pub fn active_session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn active_session_ids(&self) -> Vec<SessionId> {
        self.registry.ids()
    }

    /// Running keygen or rotation session for a profile
    pub fn exclusive_session(&self, profile_id: &str) -> Option<SessionId> {
        self.registry.exclusive_session(profile_id)
    }

    async fn drive(
        &self,
        session_id: SessionId,
        kind: SessionKind,
        profile_id: Option<&str>,
        handle: EngineHandle,
    ) -> Result<SessionOutput> {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let session = MpcSession::new(
            session_id.clone(),
            kind,
            profile_id.map(str::to_string),
            handle,
        );
        self.registry.register(session, cancel_tx)?;
        let _guard = SessionGuard {
            registry: self.registry.clone(),
            id: session_id.clone(),
        };

        info!(session_id = %session_id, %kind, "Session started");
        let mut outbound = self.registry.with_session(&session_id, |s| s.start())?;
        let mut stale = 0u32;

        loop {
            let inbound = self.exchange(&outbound, &mut cancel_rx).await?;

            match self
                .registry
                .with_session(&session_id, |s| s.advance(&inbound))?
            {
                Advance::Stale => {
                    stale += 1;
                    if stale > self.config.max_stale_messages {
                        warn!(session_id = %session_id, stale, "Too many stale replies");
                        return Err(Error::ProtocolDesync {
                            session_id,
                            expected: outbound.round,
                            received: inbound.round,
                        });
                    }
                    debug!(session_id = %session_id, round = outbound.round, "Re-sending after stale reply");
                }
                Advance::Next(message) => {
                    stale = 0;
                    debug!(session_id = %session_id, round = message.round, "Advanced to next round");
                    outbound = message;
                }
                Advance::Finished(output) => return Ok(output),
            }
        }
    }

    async fn exchange(
        &self,
        outbound: &ProtocolMessage,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<ProtocolMessage> {
        tokio::select! {
            reply = self.transport.send(outbound.clone()) => {
                reply.map_err(|e| {
                    warn!(session_id = %outbound.session_id, round = outbound.round, error = %e, "Transport failure");
                    Error::from(e)
                })
            }
            _ = cancel_rx.changed() => Err(Error::SessionCancelled(outbound.session_id.clone())),
        }
    }
}

fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}

fn key_share_from(output: SessionOutput, algorithm: Algorithm) -> Result<KeyShare> {
    match output {
        SessionOutput::KeyMaterial(material) => {
            if material.share_data.is_empty() {
                return Err(Error::Internal("engine returned empty share data".into()));
            }
            KeyShare::new(material.share_data.to_vec(), &material.public_key, algorithm)
        }
        SessionOutput::Signature(_) => Err(Error::Internal(
            "key generation session produced a signature".into(),
        )),
    }
}

/// Wrap a session failure, passing conflicts through unchanged
fn wrap_failure(err: Error, wrap: fn(Box<Error>) -> Error) -> Error {
    match err {
        Error::SessionConflict { .. } => err,
        Error::ProtocolRejected(ref reason) => {
            warn!(%reason, "Counterparty message rejected, possible tampering");
            wrap(Box::new(err))
        }
        other => wrap(Box::new(other)),
    }
}
