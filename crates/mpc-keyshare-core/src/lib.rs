//! # MPC Key-Share Core
//!
//! Orchestration and storage for a two-party MPC wallet: a device holding
//! one key share and a remote cosigner holding the other.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Session Manager**: drives multi-round keygen, rotation and signing
//!   sessions against a pluggable [`ProtocolEngine`]
//! - **Transport**: request/response channel to the cosigner backend, with a
//!   polling HTTP implementation
//! - **Key Share Store**: encrypts shares under a secure-element key (or a
//!   software key when no hardware is present) before they reach storage
//! - **Loopback engine**: a two-party Schnorr protocol and matching
//!   in-process cosigner for development and tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mpc_keyshare_core::{Algorithm, MpcWallet, WalletConfig};
//! use mpc_keyshare_core::engine::{LoopbackCosigner, LoopbackEngine};
//! use mpc_keyshare_core::storage::MemorySecureStorage;
//!
//! let cosigner = Arc::new(LoopbackCosigner::new());
//! let config = WalletConfig::new(cosigner.public_key_hex());
//! let wallet = MpcWallet::from_config(
//!     &config,
//!     Arc::new(LoopbackEngine::new()),
//!     cosigner,
//!     Arc::new(MemorySecureStorage::new()),
//! )?;
//!
//! let share = wallet.generate_wallet(Algorithm::Ecdsa, "profile-1").await?;
//! let signature = wallet.sign_message("profile-1", Algorithm::Ecdsa, b"hello").await?;
//! ```
//!
//! ## Security Model
//!
//! - The complete private key never exists on either party
//! - Shares at rest are always encrypted; reading one may require user presence
//! - Nothing is persisted until a session completes

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;
pub mod wallet;

pub use config::WalletConfig;
pub use engine::{EngineError, ProtocolEngine};
pub use error::{Error, Result};
pub use session::{SessionManager, SessionManagerConfig, SessionState};
pub use storage::{KeyShareStore, SecureStorage, StoreConfig};
pub use transport::{Transport, TransportError};
pub use types::{
    derive_address, keccak256_hash, Algorithm, KeyId, KeyShare, KeyShareMetadata, MessageType,
    ProtocolMessage, SessionId, SessionKind, Signature,
};
pub use wallet::MpcWallet;

#[cfg(feature = "http")]
pub use transport::{HttpTransport, HttpTransportConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
