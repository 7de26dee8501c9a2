//! Device encryption key resolution
//!
//! The scheme is picked once per device and recorded next to the shares.
//! Later runs follow the marker and never fall back to the other scheme.

use super::{aead, ecies, envelope_header, parse_envelope, HardwareKey, Scheme, SecureElement, SymmetricKey};
use crate::storage::{Protection, SecureStorage, StorageStatus};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Resolved device encryption key
#[derive(Clone)]
pub(crate) enum EncryptionKey {
    Hardware(Arc<dyn HardwareKey>),
    Software(SymmetricKey),
}

impl EncryptionKey {
    pub fn scheme(&self) -> Scheme {
        match self {
            EncryptionKey::Hardware(_) => Scheme::Hardware,
            EncryptionKey::Software(_) => Scheme::Software,
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let header = envelope_header(self.scheme());
        let body = match self {
            EncryptionKey::Hardware(key) => ecies::seal(key.as_ref(), &header, plaintext)?,
            EncryptionKey::Software(key) => aead::seal(key, &header, plaintext)?,
        };

        let mut out = Vec::with_capacity(header.len() + body.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn open(&self, bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let envelope = parse_envelope(bytes)?;
        if envelope.scheme != self.scheme() {
            return Err(Error::DecryptionFailure(format!(
                "ciphertext sealed with {} scheme, device uses {}",
                envelope.scheme,
                self.scheme()
            )));
        }

        match self {
            EncryptionKey::Hardware(key) => ecies::open(key.as_ref(), envelope.header, envelope.body),
            EncryptionKey::Software(key) => aead::open(key, envelope.header, envelope.body),
        }
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey({})", self.scheme())
    }
}

/// Lazily resolved encryption key owned by a key-share store
pub(crate) struct KeyProvider {
    storage: Arc<dyn SecureStorage>,
    secure_element: Option<Arc<dyn SecureElement>>,
    namespace: String,
    key: OnceCell<EncryptionKey>,
}

impl KeyProvider {
    pub fn new(
        storage: Arc<dyn SecureStorage>,
        secure_element: Option<Arc<dyn SecureElement>>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            secure_element,
            namespace: namespace.into(),
            key: OnceCell::new(),
        }
    }

    fn scheme_account(&self) -> String {
        format!("{}.encryption.scheme", self.namespace)
    }

    fn software_key_account(&self) -> String {
        format!("{}.encryption.key", self.namespace)
    }

    fn hardware_key_tag(&self) -> String {
        format!("{}.encryption.device", self.namespace)
    }

    /// Scheme in use, resolving the key on first call
    pub async fn scheme(&self) -> Result<Scheme> {
        Ok(self.key().await?.scheme())
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.key().await?.seal(plaintext)
    }

    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.key().await?.open(ciphertext)
    }

    async fn key(&self) -> Result<&EncryptionKey> {
        self.key.get_or_try_init(|| self.resolve()).await
    }

    async fn resolve(&self) -> Result<EncryptionKey> {
        match self.recorded_scheme().await? {
            Some(Scheme::Hardware) => {
                let element = self.available_element().ok_or_else(|| {
                    Error::EncryptionFailure(
                        "device is bound to hardware encryption but the secure element is unavailable"
                            .into(),
                    )
                })?;
                debug!("Loaded hardware encryption key");
                Ok(EncryptionKey::Hardware(element.load_or_create(&self.hardware_key_tag())?))
            }
            Some(Scheme::Software) => {
                let bytes = self
                    .storage
                    .read(&self.software_key_account())
                    .await?
                    .map(Zeroizing::new)
                    .ok_or_else(|| {
                        Error::DecryptionFailure("software encryption key is missing".into())
                    })?;
                debug!("Loaded software encryption key");
                Ok(EncryptionKey::Software(SymmetricKey::from_bytes(&bytes)?))
            }
            None => self.initialize().await,
        }
    }

    async fn initialize(&self) -> Result<EncryptionKey> {
        let key = match self.available_element() {
            Some(element) => EncryptionKey::Hardware(element.load_or_create(&self.hardware_key_tag())?),
            None => {
                let key = SymmetricKey::generate();
                self.storage
                    .write(&self.software_key_account(), key.as_bytes(), Protection::Standard)
                    .await?;
                EncryptionKey::Software(key)
            }
        };

        // Marker goes last so a crash never records a scheme without its key
        let marker = serde_json::to_vec(&key.scheme())?;
        self.storage
            .write(&self.scheme_account(), &marker, Protection::Standard)
            .await?;

        info!(scheme = %key.scheme(), "Selected device encryption scheme");
        Ok(key)
    }

    async fn recorded_scheme(&self) -> Result<Option<Scheme>> {
        let Some(bytes) = self.storage.read(&self.scheme_account()).await? else {
            return Ok(None);
        };

        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            Error::storage(
                StorageStatus::DecodeError,
                format!("unreadable encryption scheme marker: {e}"),
            )
        })
    }

    fn available_element(&self) -> Option<&Arc<dyn SecureElement>> {
        self.secure_element.as_ref().filter(|e| e.is_available())
    }
}
