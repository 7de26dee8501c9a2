//! Encrypted key-share store
//!
//! Each profile owns one encrypted share record and one plaintext metadata
//! record:
//!
//! ```text
//! {namespace}.keyshare.{profile_id}   encrypted KeyShare JSON (user presence)
//! {namespace}.metadata.{profile_id}   KeyShareMetadata JSON (standard)
//! ```

use super::{
    NoPresenceCheck, PresenceGate, PresenceOutcome, Protection, SecureStorage, StorageStatus,
};
use crate::crypto::provider::KeyProvider;
use crate::crypto::{Scheme, SecureElement};
use crate::types::{KeyShare, KeyShareMetadata};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

/// Key-share store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefix for every record account
    pub namespace: String,
    /// Text shown by the presence prompt
    pub presence_reason: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "mpc.wallet".to_string(),
            presence_reason: "Authenticate to use your wallet key".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_presence_reason(mut self, reason: impl Into<String>) -> Self {
        self.presence_reason = reason.into();
        self
    }
}

/// Persists key shares encrypted under the device key
pub struct KeyShareStore {
    storage: Arc<dyn SecureStorage>,
    secure_element: Option<Arc<dyn SecureElement>>,
    presence: Arc<dyn PresenceGate>,
    config: StoreConfig,
    provider: KeyProvider,
    write_lock: Mutex<()>,
}

impl KeyShareStore {
    /// Store over `storage` with software encryption and no presence prompt
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        let config = StoreConfig::default();
        Self {
            provider: KeyProvider::new(storage.clone(), None, config.namespace.clone()),
            storage,
            secure_element: None,
            presence: Arc::new(NoPresenceCheck),
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// Prefer hardware-backed encryption through `element`
    pub fn with_secure_element(mut self, element: Arc<dyn SecureElement>) -> Self {
        self.secure_element = Some(element);
        self.rebuild_provider();
        self
    }

    pub fn with_presence_gate(mut self, gate: Arc<dyn PresenceGate>) -> Self {
        self.presence = gate;
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self.rebuild_provider();
        self
    }

    fn rebuild_provider(&mut self) {
        self.provider = KeyProvider::new(
            self.storage.clone(),
            self.secure_element.clone(),
            self.config.namespace.clone(),
        );
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Encryption scheme of this device, choosing it on first use
    pub async fn encryption_scheme(&self) -> Result<Scheme> {
        self.provider.scheme().await
    }

    fn share_account(&self, profile_id: &str) -> String {
        format!("{}.keyshare.{}", self.config.namespace, profile_id)
    }

    fn metadata_account(&self, profile_id: &str) -> String {
        format!("{}.metadata.{}", self.config.namespace, profile_id)
    }

    /// Encrypt and persist `share` as the profile's only key share
    ///
    /// Replacing an existing share records the rotation time in the new
    /// metadata. If the metadata write fails the previous ciphertext is put
    /// back (or the new one removed) before the error is returned.
    #[instrument(skip(self, share), fields(key_id = %share.key_id))]
    pub async fn store(&self, share: &KeyShare, profile_id: &str) -> Result<()> {
        self.write(share, profile_id, WriteMode::Upsert).await
    }

    /// Persist `share` only if the profile has no share yet
    ///
    /// The check and the write happen under the store's write lock.
    #[instrument(skip(self, share), fields(key_id = %share.key_id))]
    pub async fn insert(&self, share: &KeyShare, profile_id: &str) -> Result<()> {
        self.write(share, profile_id, WriteMode::Insert).await
    }

    /// Overwrite the profile's existing share
    ///
    /// Fails with `KeyShareNotFound` if the slot is empty, checked under the
    /// write lock, so a share deleted meanwhile is never re-created.
    #[instrument(skip(self, share), fields(key_id = %share.key_id))]
    pub async fn replace(&self, share: &KeyShare, profile_id: &str) -> Result<()> {
        self.write(share, profile_id, WriteMode::Replace).await
    }

    async fn write(&self, share: &KeyShare, profile_id: &str, mode: WriteMode) -> Result<()> {
        validate_profile_id(profile_id)?;
        let _guard = self.write_lock.lock().await;

        let share_account = self.share_account(profile_id);
        let metadata_account = self.metadata_account(profile_id);

        let plaintext = Zeroizing::new(serde_json::to_vec(share)?);
        let ciphertext = self.provider.encrypt(&plaintext).await?;

        let previous = self
            .storage
            .read(&share_account)
            .await
            .map_err(|e| as_storage_failure(e, "read existing key share"))?;
        match (mode, &previous) {
            (WriteMode::Insert, Some(_)) => {
                return Err(Error::WalletAlreadyExists(profile_id.to_string()));
            }
            (WriteMode::Replace, None) => {
                warn!(profile_id, "Key share removed before replacement could be stored");
                return Err(Error::KeyShareNotFound(profile_id.to_string()));
            }
            _ => {}
        }

        let last_rotated = previous.as_ref().map(|_| share.created_at);
        let metadata = serde_json::to_vec(&share.metadata(profile_id, last_rotated))?;

        self.storage
            .write(&share_account, &ciphertext, Protection::UserPresence)
            .await
            .map_err(|e| as_storage_failure(e, "write key share"))?;

        if let Err(e) = self
            .storage
            .write(&metadata_account, &metadata, Protection::Standard)
            .await
        {
            warn!(profile_id, "Metadata write failed, rolling back key share");
            let rollback = match &previous {
                Some(old) => {
                    self.storage
                        .write(&share_account, old, Protection::UserPresence)
                        .await
                }
                None => self.storage.remove(&share_account).await,
            };
            if let Err(rollback_err) = rollback {
                error!(profile_id, error = %rollback_err, "Key share rollback failed");
            }
            return Err(as_storage_failure(e, "write key share metadata"));
        }

        info!(
            profile_id,
            rotated = previous.is_some(),
            "Stored encrypted key share"
        );
        Ok(())
    }

    /// Decrypt the profile's key share, `None` if the profile has none
    ///
    /// Absence is checked before the presence prompt, so a profile without a
    /// wallet never prompts.
    #[instrument(skip(self))]
    pub async fn retrieve(&self, profile_id: &str) -> Result<Option<KeyShare>> {
        validate_profile_id(profile_id)?;
        let account = self.share_account(profile_id);

        let present = self
            .storage
            .contains(&account)
            .await
            .map_err(|e| as_storage_failure(e, "check key share"))?;
        if !present {
            debug!("No key share stored");
            return Ok(None);
        }

        let outcome = self.presence.confirm(&self.config.presence_reason).await;
        if !outcome.allows_access() {
            let reason = match outcome {
                PresenceOutcome::Cancelled => "user cancelled presence check",
                _ => "presence check failed",
            };
            return Err(Error::NotAuthorized(reason.into()));
        }

        let Some(ciphertext) = self
            .storage
            .read(&account)
            .await
            .map_err(|e| as_storage_failure(e, "read key share"))?
        else {
            // Deleted between the existence check and the read
            return Ok(None);
        };

        let plaintext = self.provider.decrypt(&ciphertext).await.map_err(|e| {
            if e.is_integrity_failure() {
                error!(profile_id, error = %e, "Stored key share cannot be decrypted");
            }
            e
        })?;

        let share: KeyShare = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Deserialization(format!("decrypted key share: {e}")))?;

        debug!(key_id = %share.key_id, "Retrieved key share");
        Ok(Some(share))
    }

    /// As [`retrieve`](Self::retrieve), with absence reported as an error
    pub async fn require(&self, profile_id: &str) -> Result<KeyShare> {
        self.retrieve(profile_id)
            .await?
            .ok_or_else(|| Error::KeyShareNotFound(profile_id.to_string()))
    }

    /// Remove share and metadata; deleting a missing share succeeds
    ///
    /// If the metadata cannot be removed the share record is written back,
    /// so the pair is either fully present or fully gone.
    #[instrument(skip(self))]
    pub async fn delete(&self, profile_id: &str) -> Result<()> {
        validate_profile_id(profile_id)?;
        let _guard = self.write_lock.lock().await;

        let share_account = self.share_account(profile_id);
        let previous = self
            .storage
            .read(&share_account)
            .await
            .map_err(|e| as_storage_failure(e, "read key share"))?;

        self.storage
            .remove(&share_account)
            .await
            .map_err(|e| as_storage_failure(e, "remove key share"))?;

        if let Err(e) = self.storage.remove(&self.metadata_account(profile_id)).await {
            warn!(profile_id, "Metadata removal failed, restoring key share");
            if let Some(ciphertext) = &previous {
                if let Err(restore_err) = self
                    .storage
                    .write(&share_account, ciphertext, Protection::UserPresence)
                    .await
                {
                    error!(profile_id, error = %restore_err, "Key share restore failed");
                }
            }
            return Err(as_storage_failure(e, "remove key share metadata"));
        }

        info!(profile_id, "Deleted key share");
        Ok(())
    }

    /// Whether an encrypted share record exists; never prompts or decrypts
    pub async fn exists(&self, profile_id: &str) -> Result<bool> {
        validate_profile_id(profile_id)?;
        self.storage
            .contains(&self.share_account(profile_id))
            .await
            .map_err(|e| as_storage_failure(e, "check key share"))
    }

    /// Unencrypted metadata for the profile
    pub async fn metadata(&self, profile_id: &str) -> Result<Option<KeyShareMetadata>> {
        validate_profile_id(profile_id)?;
        let Some(bytes) = self
            .storage
            .read(&self.metadata_account(profile_id))
            .await
            .map_err(|e| as_storage_failure(e, "read key share metadata"))?
        else {
            return Ok(None);
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Deserialization(format!("key share metadata: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Upsert,
    Insert,
    Replace,
}

fn validate_profile_id(profile_id: &str) -> Result<()> {
    if profile_id.trim().is_empty() || profile_id.chars().any(char::is_control) {
        return Err(Error::storage(
            StorageStatus::ParameterError,
            format!("invalid profile id {profile_id:?}"),
        ));
    }
    Ok(())
}

/// Normalize backend failures into `StorageFailure` with operation context
fn as_storage_failure(err: Error, operation: &str) -> Error {
    match err {
        Error::StorageFailure { status, context } => Error::StorageFailure {
            status,
            context: format!("{operation}: {context}"),
        },
        Error::Io(e) => Error::storage(
            StorageStatus::Other(e.raw_os_error().unwrap_or(-1)),
            format!("{operation}: {e}"),
        ),
        other => other,
    }
}
