//! Wallet configuration
//!
//! Loaded from JSON, e.g.
//!
//! ```json
//! {
//!   "cosigner_public_key": "02a1633c...",
//!   "session": { "max_stale_messages": 3 },
//!   "store": { "namespace": "mpc.wallet" },
//!   "transport": { "base_url": "https://cosigner.example.com" }
//! }
//! ```

use crate::session::SessionManagerConfig;
use crate::storage::StoreConfig;
#[cfg(feature = "http")]
use crate::transport::HttpTransportConfig;
use crate::{Error, Result};
use k256::PublicKey;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for an [`MpcWallet`](crate::MpcWallet)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Hex-encoded SEC1 public key of the remote cosigner
    pub cosigner_public_key: String,
    #[serde(default)]
    pub session: SessionManagerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Polling transport towards the cosigner proxy
    #[cfg(feature = "http")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<HttpTransportConfig>,
}

impl WalletConfig {
    pub fn new(cosigner_public_key: impl Into<String>) -> Self {
        Self {
            cosigner_public_key: cosigner_public_key.into(),
            session: SessionManagerConfig::default(),
            store: StoreConfig::default(),
            #[cfg(feature = "http")]
            transport: None,
        }
    }

    pub fn with_session(mut self, session: SessionManagerConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    #[cfg(feature = "http")]
    pub fn with_transport(mut self, transport: HttpTransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.cosigner_public_key_bytes()?;

        let namespace = &self.store.namespace;
        if namespace.is_empty() || namespace.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(Error::InvalidConfig(format!(
                "store namespace {namespace:?} must be non-empty without whitespace"
            )));
        }

        #[cfg(feature = "http")]
        if let Some(transport) = &self.transport {
            let url = &transport.base_url;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::InvalidConfig(format!(
                    "transport base_url {url:?} must be an http(s) URL"
                )));
            }
            if transport.poll_interval_ms == 0 {
                return Err(Error::InvalidConfig(
                    "transport poll_interval_ms must be positive".into(),
                ));
            }
            if transport.max_polls == Some(0) {
                return Err(Error::InvalidConfig(
                    "transport max_polls must be positive when set".into(),
                ));
            }
        }

        Ok(())
    }

    /// Decoded cosigner key, checked to be a valid secp256k1 point
    pub fn cosigner_public_key_bytes(&self) -> Result<Vec<u8>> {
        let hex_key = self.cosigner_public_key.trim_start_matches("0x");
        let bytes = hex::decode(hex_key)
            .map_err(|e| Error::InvalidPublicKey(format!("cosigner key: {e}")))?;
        PublicKey::from_sec1_bytes(&bytes)
            .map_err(|_| Error::InvalidPublicKey("cosigner key is not a valid point".into()))?;
        Ok(bytes)
    }
}
