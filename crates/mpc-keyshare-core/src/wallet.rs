//! Caller-facing wallet API
//!
//! [`MpcWallet`] wires a [`SessionManager`] to a [`KeyShareStore`]: protocol
//! results are persisted only after a session completes, and signing always
//! starts from the stored share.

use crate::config::WalletConfig;
use crate::engine::ProtocolEngine;
use crate::session::{SessionManager, SessionState};
use crate::storage::{KeyShareStore, SecureStorage};
use crate::transport::Transport;
use crate::types::{keccak256_hash, Algorithm, KeyShare, KeyShareMetadata, Signature};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// MPC wallet for a set of profiles, one key share each
pub struct MpcWallet {
    sessions: SessionManager,
    store: KeyShareStore,
    cosigner_public_key: Vec<u8>,
}

impl MpcWallet {
    pub fn new(sessions: SessionManager, store: KeyShareStore, cosigner_public_key: Vec<u8>) -> Self {
        Self {
            sessions,
            store,
            cosigner_public_key,
        }
    }

    /// Build a wallet from validated configuration
    pub fn from_config(
        config: &WalletConfig,
        engine: Arc<dyn ProtocolEngine>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn SecureStorage>,
    ) -> Result<Self> {
        config.validate()?;
        let sessions = SessionManager::new(engine, transport, config.session.clone());
        let store = KeyShareStore::new(storage).with_config(config.store.clone());
        Ok(Self::new(sessions, store, config.cosigner_public_key_bytes()?))
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn store(&self) -> &KeyShareStore {
        &self.store
    }

    pub fn cosigner_public_key(&self) -> &[u8] {
        &self.cosigner_public_key
    }

    /// Run key generation for a profile and persist the result
    ///
    /// Fails with `WalletAlreadyExists` if the profile already has a share,
    /// including one stored by a concurrent call while the session ran.
    #[instrument(skip(self))]
    pub async fn generate_wallet(&self, algorithm: Algorithm, profile_id: &str) -> Result<KeyShare> {
        if self.store.exists(profile_id).await? {
            return Err(Error::WalletAlreadyExists(profile_id.to_string()));
        }

        let share = self
            .sessions
            .begin_key_generation(algorithm, &self.cosigner_public_key, profile_id)
            .await?;

        if let Err(e) = self.store.insert(&share, profile_id).await {
            warn!(profile_id, error = %e, "Generated key share was not persisted");
            return Err(e);
        }

        info!(profile_id, address = %share.address, "Wallet created");
        Ok(share)
    }

    /// Sign a 32-byte digest with the profile's key share
    #[instrument(skip(self, digest))]
    pub async fn sign(
        &self,
        profile_id: &str,
        algorithm: Algorithm,
        digest: &[u8; 32],
    ) -> Result<Signature> {
        let share = self.store.require(profile_id).await?;
        if share.algorithm != algorithm {
            return Err(Error::AlgorithmMismatch {
                expected: algorithm,
                actual: share.algorithm,
            });
        }
        self.sessions.begin_signing(&share, digest).await
    }

    /// Sign the Keccak-256 hash of `message`
    pub async fn sign_message(
        &self,
        profile_id: &str,
        algorithm: Algorithm,
        message: &[u8],
    ) -> Result<Signature> {
        self.sign(profile_id, algorithm, &keccak256_hash(message))
            .await
    }

    /// Replace the profile's key share with a rotated one
    ///
    /// Engines that refresh shares keep the public key and address. The old
    /// share stays in place if the session or the write fails, and a wallet
    /// deleted while the session ran stays deleted.
    #[instrument(skip(self))]
    pub async fn rotate_wallet(&self, profile_id: &str) -> Result<KeyShare> {
        let current = self.store.require(profile_id).await?;
        let rotated = self
            .sessions
            .begin_key_rotation(&current, &self.cosigner_public_key, profile_id)
            .await?;
        self.store.replace(&rotated, profile_id).await?;

        info!(
            profile_id,
            old_key_id = %current.key_id,
            new_key_id = %rotated.key_id,
            "Wallet rotated"
        );
        Ok(rotated)
    }

    pub async fn has_wallet(&self, profile_id: &str) -> Result<bool> {
        self.store.exists(profile_id).await
    }

    pub async fn wallet_metadata(&self, profile_id: &str) -> Result<Option<KeyShareMetadata>> {
        self.store.metadata(profile_id).await
    }

    /// Remove the profile's key share; a missing wallet is not an error
    pub async fn delete_wallet(&self, profile_id: &str) -> Result<()> {
        self.store.delete(profile_id).await
    }

    pub fn cancel_session(&self, session_id: &str) -> bool {
        self.sessions.cancel_session(session_id)
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.session_state(session_id)
    }
}
