//! Hybrid public-key encryption to a secure-element keypair
//!
//! Sealing generates an ephemeral secp256k1 key, performs ECDH with the
//! hardware public key, expands the shared secret with HKDF-SHA256 and
//! encrypts with ChaCha20-Poly1305. Opening asks the secure element for the
//! ECDH agreement, so the private half is never in application memory.
//!
//! Body layout: `ephemeral_pubkey (33, compressed) || nonce || ciphertext || tag`.

use super::aead::{self, SymmetricKey};
use crate::{Error, Result};
use dashmap::DashMap;
use hkdf::Hkdf;
use k256::{PublicKey, SecretKey, ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint};
use rand::rngs::OsRng;
use sha2::Sha256;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use zeroize::Zeroizing;

/// Compressed SEC1 point length
pub const EPHEMERAL_KEY_LEN: usize = 33;

const HKDF_INFO: &[u8] = b"mpc-keyshare/ecies/chacha20poly1305/v1";

/// Keypair whose private half lives inside dedicated hardware
pub trait HardwareKey: Send + Sync {
    fn public_key(&self) -> PublicKey;

    /// ECDH with `peer`, returning the raw shared x-coordinate
    fn agree(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; 32]>>;
}

/// Secure element (or TEE keystore) able to hold hardware keys
pub trait SecureElement: Send + Sync {
    fn is_available(&self) -> bool;

    /// Load the key with `tag`, generating it inside the element on first use
    fn load_or_create(&self, tag: &str) -> Result<Arc<dyn HardwareKey>>;
}

/// Encrypt `plaintext` to `recipient`
pub fn seal(recipient: &dyn HardwareKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient_pk = recipient.public_key();
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_pk = ephemeral.public_key();
    let ephemeral_bytes = ephemeral_pk.to_encoded_point(true);

    let shared = ephemeral.diffie_hellman(&recipient_pk);
    let mut secret = Zeroizing::new([0u8; 32]);
    secret.copy_from_slice(shared.raw_secret_bytes().as_slice());

    let key = derive_key(&secret, ephemeral_bytes.as_bytes(), &recipient_pk)
        .map_err(|e| Error::EncryptionFailure(format!("key derivation failed: {e}")))?;

    let body = aead::seal(&key, aad, plaintext)?;

    let mut out = Vec::with_capacity(EPHEMERAL_KEY_LEN + body.len());
    out.extend_from_slice(ephemeral_bytes.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decrypt a body produced by [`seal`]
pub fn open(recipient: &dyn HardwareKey, aad: &[u8], body: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if body.len() < EPHEMERAL_KEY_LEN {
        return Err(Error::DecryptionFailure("ciphertext truncated".into()));
    }
    let (ephemeral_bytes, rest) = body.split_at(EPHEMERAL_KEY_LEN);

    let ephemeral_pk = PublicKey::from_sec1_bytes(ephemeral_bytes)
        .map_err(|_| Error::DecryptionFailure("invalid ephemeral public key".into()))?;

    let secret = recipient.agree(&ephemeral_pk)?;
    let key = derive_key(&secret, ephemeral_bytes, &recipient.public_key())
        .map_err(|e| Error::DecryptionFailure(format!("key derivation failed: {e}")))?;

    aead::open(&key, aad, rest)
}

fn derive_key(
    secret: &[u8; 32],
    ephemeral: &[u8],
    recipient: &PublicKey,
) -> std::result::Result<SymmetricKey, hkdf::InvalidLength> {
    let mut salt = Vec::with_capacity(EPHEMERAL_KEY_LEN * 2);
    salt.extend_from_slice(ephemeral);
    salt.extend_from_slice(recipient.to_encoded_point(true).as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), secret);
    let mut okm = Zeroizing::new([0u8; aead::KEY_LEN]);
    hk.expand(HKDF_INFO, okm.as_mut())?;

    Ok(SymmetricKey::from_secret(okm))
}

/// Software stand-in for a secure element
///
/// Keys live in process memory, so this only models the interface for tests
/// and development hosts. It can be switched off to simulate a device that
/// lost (or never had) hardware backing.
#[derive(Default)]
pub struct SimulatedSecureElement {
    keys: DashMap<String, Arc<SimulatedHardwareKey>>,
    unavailable: AtomicBool,
}

impl SimulatedSecureElement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

impl SecureElement for SimulatedSecureElement {
    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    fn load_or_create(&self, tag: &str) -> Result<Arc<dyn HardwareKey>> {
        if !self.is_available() {
            return Err(Error::EncryptionFailure("secure element unavailable".into()));
        }

        let key: Arc<dyn HardwareKey> = self
            .keys
            .entry(tag.to_string())
            .or_insert_with(|| {
                Arc::new(SimulatedHardwareKey {
                    secret: SecretKey::random(&mut OsRng),
                })
            })
            .clone();

        Ok(key)
    }
}

struct SimulatedHardwareKey {
    secret: SecretKey,
}

impl HardwareKey for SimulatedHardwareKey {
    fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    fn agree(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; 32]>> {
        let shared = k256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}
