//! Core types for the key-share subsystem
//!
//! This module defines the durable key-share artifact, its unencrypted
//! metadata projection, the protocol message envelope exchanged with the
//! cosigner, and the address derivation shared by every consumer.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Unique identifier for a protocol run
pub type SessionId = String;

/// Length of a derived address including the `0x` prefix
pub const ADDRESS_LEN: usize = 42;

/// Signature scheme a key share was generated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Two-party ECDSA (secp256k1)
    Ecdsa,
    /// Two-party EdDSA (ed25519)
    Eddsa,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Ecdsa => write!(f, "ECDSA"),
            Algorithm::Eddsa => write!(f, "EdDSA"),
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ecdsa" => Ok(Algorithm::Ecdsa),
            "eddsa" => Ok(Algorithm::Eddsa),
            other => Err(Error::InvalidConfig(format!("unknown algorithm: {other}"))),
        }
    }
}

/// Opaque key-share identifier, generated at keygen time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of protocol run a session performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    KeyGeneration,
    Signing,
    KeyRotation,
}

impl SessionKind {
    /// Upper bound on rounds for this kind; a sanity check, not the completion signal
    pub fn max_rounds(&self) -> u32 {
        match self {
            SessionKind::KeyGeneration | SessionKind::KeyRotation => 3,
            SessionKind::Signing => 5,
        }
    }

    /// Message type carried by every envelope of this session kind
    pub fn message_type(&self) -> MessageType {
        match self {
            SessionKind::KeyGeneration => MessageType::Keygen,
            SessionKind::Signing => MessageType::Sign,
            SessionKind::KeyRotation => MessageType::Rotation,
        }
    }

    /// Whether at most one session of this kind may run per profile
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, SessionKind::Signing)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::KeyGeneration => write!(f, "keygen"),
            SessionKind::Signing => write!(f, "signing"),
            SessionKind::KeyRotation => write!(f, "rotation"),
        }
    }
}

/// Purpose of a protocol message; together with the round it reads as
/// "keygen round N" or "sign round N"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Keygen,
    Sign,
    Rotation,
}

/// Unit exchanged with the remote cosigner each round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub session_id: SessionId,
    pub round: u32,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Opaque engine payload, base64 on the wire
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    pub fn new(
        session_id: impl Into<SessionId>,
        round: u32,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            round,
            message_type,
            payload,
        }
    }
}

/// Local party's share of a distributed key
///
/// Immutable once created. `share_data` is zeroized when the value is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    #[zeroize(skip)]
    pub key_id: KeyId,

    /// Opaque engine share material
    #[serde(with = "base64_bytes")]
    pub share_data: Vec<u8>,

    /// Hex-encoded combined public key
    #[zeroize(skip)]
    pub public_key: String,

    /// Address derived from `public_key`
    #[zeroize(skip)]
    pub address: String,

    #[zeroize(skip)]
    pub algorithm: Algorithm,

    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
}

impl KeyShare {
    /// Assemble a key share from finished engine output
    pub fn new(share_data: Vec<u8>, public_key: &[u8], algorithm: Algorithm) -> Result<Self> {
        let public_key = hex::encode(public_key);
        let address = derive_address(&public_key)?;

        Ok(Self {
            key_id: KeyId::generate(),
            share_data,
            public_key,
            address,
            algorithm,
            created_at: Utc::now(),
        })
    }

    /// Non-sensitive projection stored next to the encrypted share
    pub fn metadata(
        &self,
        profile_id: &str,
        last_rotated: Option<DateTime<Utc>>,
    ) -> KeyShareMetadata {
        KeyShareMetadata {
            profile_id: profile_id.to_string(),
            key_id: self.key_id.clone(),
            public_key: self.public_key.clone(),
            address: self.address.clone(),
            algorithm: self.algorithm,
            created_at: self.created_at,
            last_rotated,
        }
    }

    /// Raw bytes of the combined public key
    pub fn public_key_bytes(&self) -> Result<Vec<u8>> {
        decode_hex_key(&self.public_key)
    }
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("key_id", &self.key_id)
            .field("share_data", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .field("address", &self.address)
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Unencrypted key-share projection used for existence and lookup checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShareMetadata {
    pub profile_id: String,
    pub key_id: KeyId,
    pub public_key: String,
    pub address: String,
    pub algorithm: Algorithm,
    pub created_at: DateTime<Utc>,
    pub last_rotated: Option<DateTime<Utc>>,
}

/// Combined signature produced by a signing session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub algorithm: Algorithm,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl Signature {
    pub fn new(algorithm: Algorithm, bytes: Vec<u8>) -> Self {
        Self { algorithm, bytes }
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.bytes))
    }
}

/// Derive the short address for a hex public key
///
/// Strips an optional `0x` prefix, decodes the hex (any case), hashes the
/// bytes with Keccak-256 and hex-encodes the last 20 bytes with a `0x` prefix.
pub fn derive_address(public_key: &str) -> Result<String> {
    let bytes = decode_hex_key(public_key)?;
    let hash = keccak256_hash(&bytes);
    Ok(format!("0x{}", hex::encode(&hash[12..])))
}

fn decode_hex_key(public_key: &str) -> Result<Vec<u8>> {
    let trimmed = public_key.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if stripped.is_empty() {
        return Err(Error::InvalidPublicKey("empty public key".into()));
    }

    hex::decode(stripped).map_err(|e| Error::InvalidPublicKey(e.to_string()))
}

/// Compute Keccak256 hash of data
pub fn keccak256_hash(data: &[u8]) -> [u8; 32] {
    use tiny_keccak::{Hasher, Keccak};
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hasher.finalize(&mut hash);
    hash
}

pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
