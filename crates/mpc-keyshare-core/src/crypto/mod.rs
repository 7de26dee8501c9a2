//! Encryption of key shares at rest
//!
//! Two schemes are supported:
//!
//! - **Hardware**: ECIES to a secure-element keypair (preferred)
//! - **Software**: ChaCha20-Poly1305 under a 256-bit key kept in secure storage
//!
//! Every ciphertext is wrapped in a small envelope so a stored item always
//! names the scheme it was sealed with:
//!
//! ```text
//! version (1) || scheme (1) || body
//! ```
//!
//! The two header bytes are bound to the AEAD as associated data.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod aead;
pub mod ecies;
pub(crate) mod provider;

pub use aead::SymmetricKey;
pub use ecies::{HardwareKey, SecureElement, SimulatedSecureElement};

/// Current envelope version
pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = 2;

/// Encryption scheme chosen for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    Software,
    Hardware,
}

impl Scheme {
    fn tag(&self) -> u8 {
        match self {
            Scheme::Software => 1,
            Scheme::Hardware => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Scheme::Software),
            2 => Some(Scheme::Hardware),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Software => write!(f, "software"),
            Scheme::Hardware => write!(f, "hardware"),
        }
    }
}

/// Parsed envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Envelope<'a> {
    pub scheme: Scheme,
    pub header: &'a [u8],
    pub body: &'a [u8],
}

pub(crate) fn envelope_header(scheme: Scheme) -> [u8; HEADER_LEN] {
    [ENVELOPE_VERSION, scheme.tag()]
}

pub(crate) fn parse_envelope(bytes: &[u8]) -> Result<Envelope<'_>> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::DecryptionFailure("envelope truncated".into()));
    }
    let (header, body) = bytes.split_at(HEADER_LEN);

    if header[0] != ENVELOPE_VERSION {
        return Err(Error::DecryptionFailure(format!(
            "unsupported envelope version {}",
            header[0]
        )));
    }
    let scheme = Scheme::from_tag(header[1]).ok_or_else(|| {
        Error::DecryptionFailure(format!("unknown encryption scheme tag {}", header[1]))
    })?;

    Ok(Envelope {
        scheme,
        header,
        body,
    })
}
