//! Key Share Storage
//!
//! Key shares are always stored encrypted inside the platform's secure
//! storage. This module provides:
//!
//! - **SecureStorage**: the platform vault seam (keychain/keystore style records)
//! - **MemorySecureStorage**: in-memory vault (testing)
//! - **FileSecureStorage**: local files with restrictive permissions (development)
//! - **PresenceGate**: biometric/passcode confirmation before secret reads
//! - **KeyShareStore**: encrypts, persists and indexes key shares per profile
//!
//! ## Example
//!
//! ```rust,ignore
//! use mpc_keyshare_core::storage::{KeyShareStore, MemorySecureStorage};
//!
//! let store = KeyShareStore::new(Arc::new(MemorySecureStorage::new()));
//! store.store(&share, "profile-1").await?;
//! let loaded = store.retrieve("profile-1").await?;
//! ```

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod file;
pub mod memory;
pub mod presence;
pub mod store;

pub use file::FileSecureStorage;
pub use memory::MemorySecureStorage;
pub use presence::{NoPresenceCheck, PresenceGate, PresenceOutcome};
pub use store::{KeyShareStore, StoreConfig};

/// Status reported by the platform secure storage
///
/// Codes follow the keychain `OSStatus` values so platform adapters can pass
/// their native status through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStatus {
    NotFound,
    AuthFailed,
    UserCancelled,
    DecodeError,
    ParameterError,
    Other(i32),
}

impl StorageStatus {
    pub fn code(&self) -> i32 {
        match self {
            StorageStatus::NotFound => -25300,
            StorageStatus::AuthFailed => -25293,
            StorageStatus::UserCancelled => -128,
            StorageStatus::DecodeError => -26275,
            StorageStatus::ParameterError => -50,
            StorageStatus::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -25300 => StorageStatus::NotFound,
            -25293 => StorageStatus::AuthFailed,
            -128 => StorageStatus::UserCancelled,
            -26275 => StorageStatus::DecodeError,
            -50 => StorageStatus::ParameterError,
            other => StorageStatus::Other(other),
        }
    }

    /// Human-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            StorageStatus::NotFound => "item not found",
            StorageStatus::AuthFailed => "authentication failed",
            StorageStatus::UserCancelled => "user cancelled",
            StorageStatus::DecodeError => "unable to decode item",
            StorageStatus::ParameterError => "invalid parameter",
            StorageStatus::Other(_) => "secure storage error",
        }
    }
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.reason(), self.code())
    }
}

/// Access protection requested for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protection {
    /// Readable whenever the device is unlocked
    Standard,
    /// Readable only after a user-presence check
    UserPresence,
}

/// Platform secure storage (keychain / keystore) backend
///
/// Records are opaque byte blobs addressed by an account string. A missing
/// record is `Ok(None)` / a no-op, never an error.
#[async_trait]
pub trait SecureStorage: Send + Sync {
    /// Read a record
    async fn read(&self, account: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace a record
    async fn write(&self, account: &str, data: &[u8], protection: Protection) -> Result<()>;

    /// Remove a record; removing a missing record succeeds
    async fn remove(&self, account: &str) -> Result<()>;

    /// Check if a record exists without reading it
    async fn contains(&self, account: &str) -> Result<bool>;
}
