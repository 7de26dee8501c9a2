//! Two-party Schnorr engine over secp256k1 for development and tests
//!
//! The joint key is `P = X1 + X2` where the device holds `x1` and the
//! cosigner holds `x2`. Neither side ever sees the other's secret.
//!
//! Key generation (3 rounds):
//! 1. device sends `H(X1, b1)`, cosigner answers `H(X2, b2)`
//! 2. both reveal `X, b` with a proof of knowledge bound to the cosigner key
//! 3. both send a confirmation hash of `P`
//!
//! Rotation (3 rounds) refreshes both shares and keeps `P`:
//! 1. device sends `P || X1 || H(s1, b1)`, cosigner answers `H(s2, b2)`
//! 2. both reveal their seed and blinding, `delta = H(P, s1, s2)`
//! 3. both confirm `X1 + delta * G`; the device keeps `x1 + delta` and the
//!    cosigner `x2 - delta`
//!
//! Signing (3 rounds):
//! 1. device sends `P || X1 || digest || H(R1, b1)`, cosigner answers `H(R2, b2)`
//! 2. both reveal their nonce point and blinding
//! 3. partial signatures `s_i = k_i + e * x_i` with `e = H(R, P, m)`,
//!    each checked as `s_i * G = R_i + e * X_i`
//!
//! The resulting signature is `R (33) || s (32)`.

use super::schnorr::{self, Reader, COSIGNER_PARTY, DEVICE_PARTY, HASH_LEN};
use super::{
    EngineError, EngineSession, KeyMaterial, ProtocolEngine, RoundOutcome, SignatureOutput,
};
use crate::types::{Algorithm, KeyShare, SessionId};
use k256::{ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of a loopback signature
pub const SIGNATURE_LEN: usize = schnorr::POINT_LEN + schnorr::SCALAR_LEN;

/// Rounds in every loopback keygen, rotation and signing run
pub const PROTOCOL_ROUNDS: u32 = 3;

/// Local party of the loopback protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackEngine;

impl LoopbackEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ProtocolEngine for LoopbackEngine {
    fn keygen(
        &self,
        algorithm: Algorithm,
        cloud_public_key: &[u8],
        session_id: &SessionId,
    ) -> Result<Box<dyn EngineSession<Output = KeyMaterial>>, EngineError> {
        ensure_supported(algorithm)?;
        schnorr::decode_point(cloud_public_key)
            .map_err(|_| EngineError::Malformed("cosigner public key is not a curve point".into()))?;

        let secret = schnorr::random_scalar();
        Ok(Box::new(KeygenSession {
            session_id: session_id.clone(),
            cloud_public_key: cloud_public_key.to_vec(),
            public: ProjectivePoint::GENERATOR * secret,
            secret: Some(secret),
            blind: schnorr::random_blind(),
            peer_commitment: None,
            peer_public: None,
            joint: None,
        }))
    }

    fn rotation(
        &self,
        current: &KeyShare,
        _cloud_public_key: &[u8],
        session_id: &SessionId,
    ) -> Result<Box<dyn EngineSession<Output = KeyMaterial>>, EngineError> {
        let (secret, peer_public, joint) = load_share(current)?;
        Ok(Box::new(RefreshSession {
            session_id: session_id.clone(),
            secret: Some(secret),
            peer_public,
            joint,
            seed: schnorr::random_blind(),
            blind: schnorr::random_blind(),
            peer_commitment: None,
            refreshed: None,
        }))
    }

    fn signing(
        &self,
        share: &KeyShare,
        digest: &[u8; 32],
        session_id: &SessionId,
    ) -> Result<Box<dyn EngineSession<Output = SignatureOutput>>, EngineError> {
        let (secret, peer_public, joint) = load_share(share)?;

        let nonce = schnorr::random_scalar();
        Ok(Box::new(SigningSession {
            session_id: session_id.clone(),
            secret: Some(secret),
            joint,
            peer_public,
            digest: *digest,
            nonce_point: ProjectivePoint::GENERATOR * nonce,
            nonce: Some(nonce),
            blind: schnorr::random_blind(),
            peer_commitment: None,
            peer_nonce: None,
            challenge: None,
            partial: None,
        }))
    }
}

fn ensure_supported(algorithm: Algorithm) -> Result<(), EngineError> {
    match algorithm {
        Algorithm::Ecdsa => Ok(()),
        Algorithm::Eddsa => Err(EngineError::Internal(
            "loopback engine only implements the secp256k1 profile".into(),
        )),
    }
}

/// Decode `x1`, `X2` and `P` from a stored share and check `x1 * G + X2 = P`
fn load_share(share: &KeyShare) -> Result<(Scalar, ProjectivePoint, ProjectivePoint), EngineError> {
    ensure_supported(share.algorithm)?;

    let stored: LoopbackShare = serde_json::from_slice(&share.share_data)
        .map_err(|e| EngineError::Malformed(format!("share data: {e}")))?;
    let secret = schnorr::decode_scalar(&Zeroizing::new(
        hex::decode(&stored.secret).map_err(|e| EngineError::Malformed(e.to_string()))?,
    ))?;
    let peer_public = schnorr::decode_point(
        &hex::decode(&stored.cosigner_public).map_err(|e| EngineError::Malformed(e.to_string()))?,
    )?;
    let joint = schnorr::decode_point(
        &share
            .public_key_bytes()
            .map_err(|e| EngineError::Malformed(e.to_string()))?,
    )?;

    if ProjectivePoint::GENERATOR * secret + peer_public != joint {
        return Err(EngineError::Malformed(
            "share data does not match the public key".into(),
        ));
    }
    Ok((secret, peer_public, joint))
}

fn encode_share(
    secret: &Scalar,
    cosigner_public: &ProjectivePoint,
) -> Result<Zeroizing<Vec<u8>>, EngineError> {
    let stored = LoopbackShare {
        secret: hex::encode(schnorr::encode_scalar(secret)),
        cosigner_public: hex::encode(schnorr::encode_point(cosigner_public)),
    };
    serde_json::to_vec(&stored)
        .map(Zeroizing::new)
        .map_err(|e| EngineError::Internal(e.to_string()))
}

/// Check a loopback signature against a joint public key
pub fn verify_signature(public_key: &[u8], digest: &[u8; 32], signature: &[u8]) -> bool {
    let check = || -> Result<bool, EngineError> {
        let joint = schnorr::decode_point(public_key)?;
        let mut reader = Reader::new(signature, "signature");
        let nonce = reader.point()?;
        let s = reader.scalar()?;
        reader.finish()?;

        let e = schnorr::challenge(&nonce, &joint, digest);
        Ok(ProjectivePoint::GENERATOR * s == nonce + joint * e)
    };
    check().unwrap_or(false)
}

/// Persisted device share: `x1` and the cosigner's public share `X2`
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct LoopbackShare {
    secret: String,
    cosigner_public: String,
}

fn released() -> EngineError {
    EngineError::Internal("session state released".into())
}

fn unexpected_round(round: u32) -> EngineError {
    EngineError::Internal(format!("no handler for round {round}"))
}

struct KeygenSession {
    session_id: SessionId,
    cloud_public_key: Vec<u8>,
    secret: Option<Scalar>,
    public: ProjectivePoint,
    blind: [u8; 32],
    peer_commitment: Option<[u8; HASH_LEN]>,
    peer_public: Option<ProjectivePoint>,
    joint: Option<ProjectivePoint>,
}

impl KeygenSession {
    fn secret(&self) -> Result<&Scalar, EngineError> {
        self.secret.as_ref().ok_or_else(released)
    }

    fn reveal(&self) -> Result<Vec<u8>, EngineError> {
        let ctx = schnorr::proof_context(&self.session_id, &self.cloud_public_key, DEVICE_PARTY);
        let mut out = schnorr::encode_point(&self.public);
        out.extend_from_slice(&self.blind);
        out.extend_from_slice(&schnorr::prove(self.secret()?, &self.public, &ctx));
        Ok(out)
    }

    fn accept_reveal(&mut self, payload: &[u8]) -> Result<Vec<u8>, EngineError> {
        let commitment = self
            .peer_commitment
            .ok_or_else(|| EngineError::Internal("missing cosigner commitment".into()))?;

        let mut reader = Reader::new(payload, "keygen reveal");
        let point_bytes = reader.take(schnorr::POINT_LEN)?;
        let blind = reader.hash()?;
        let proof = reader.take(schnorr::PROOF_LEN)?;
        reader.finish()?;

        schnorr::verify_commitment(&commitment, point_bytes, &blind)?;
        let peer_public = schnorr::decode_point(point_bytes)?;
        let ctx = schnorr::proof_context(&self.session_id, &self.cloud_public_key, COSIGNER_PARTY);
        schnorr::verify_proof(proof, &peer_public, &ctx)?;

        let joint = self.public + peer_public;
        self.peer_public = Some(peer_public);
        self.joint = Some(joint);
        Ok(schnorr::confirmation(&self.session_id, &joint).to_vec())
    }

    fn finish(&mut self, payload: &[u8]) -> Result<KeyMaterial, EngineError> {
        let mut reader = Reader::new(payload, "keygen confirmation");
        let confirmation = reader.hash()?;
        reader.finish()?;

        let (joint, peer_public) = self
            .joint
            .zip(self.peer_public)
            .ok_or_else(|| EngineError::Internal("joint key not computed".into()))?;
        if confirmation != schnorr::confirmation(&self.session_id, &joint) {
            return Err(EngineError::Rejected(
                "cosigner derived a different joint key".into(),
            ));
        }

        let share_data = encode_share(self.secret()?, &peer_public)?;

        debug!(session_id = %self.session_id, "Loopback key generation finished");
        Ok(KeyMaterial {
            share_data,
            public_key: schnorr::encode_point(&joint),
        })
    }
}

impl EngineSession for KeygenSession {
    type Output = KeyMaterial;

    fn initial_message(&mut self) -> Result<Vec<u8>, EngineError> {
        Ok(schnorr::commit(&schnorr::encode_point(&self.public), &self.blind).to_vec())
    }

    fn process(
        &mut self,
        round: u32,
        payload: &[u8],
    ) -> Result<RoundOutcome<KeyMaterial>, EngineError> {
        match round {
            1 => {
                let mut reader = Reader::new(payload, "keygen commitment");
                self.peer_commitment = Some(reader.hash()?);
                reader.finish()?;
                Ok(RoundOutcome::Continue(self.reveal()?))
            }
            2 => Ok(RoundOutcome::Continue(self.accept_reveal(payload)?)),
            PROTOCOL_ROUNDS => Ok(RoundOutcome::Finished(self.finish(payload)?)),
            other => Err(unexpected_round(other)),
        }
    }

    fn release(&mut self) {
        self.secret.zeroize();
        self.blind.zeroize();
    }
}

struct RefreshSession {
    session_id: SessionId,
    secret: Option<Scalar>,
    peer_public: ProjectivePoint,
    joint: ProjectivePoint,
    seed: [u8; 32],
    blind: [u8; 32],
    peer_commitment: Option<[u8; HASH_LEN]>,
    refreshed: Option<Scalar>,
}

impl RefreshSession {
    fn apply_delta(&mut self, payload: &[u8]) -> Result<Vec<u8>, EngineError> {
        let commitment = self
            .peer_commitment
            .ok_or_else(|| EngineError::Internal("missing cosigner seed commitment".into()))?;

        let mut reader = Reader::new(payload, "refresh reveal");
        let peer_seed = reader.hash()?;
        let blind = reader.hash()?;
        reader.finish()?;
        schnorr::verify_commitment(&commitment, &peer_seed, &blind)?;

        let secret = self.secret.ok_or_else(released)?;
        let delta = schnorr::refresh_delta(&self.session_id, &self.joint, &self.seed, &peer_seed);
        let refreshed = secret + delta;
        self.refreshed = Some(refreshed);

        let device_public = ProjectivePoint::GENERATOR * refreshed;
        Ok(schnorr::refresh_confirmation(&self.session_id, &self.joint, &device_public).to_vec())
    }

    fn finish(&mut self, payload: &[u8]) -> Result<KeyMaterial, EngineError> {
        let mut reader = Reader::new(payload, "refresh confirmation");
        let confirmation = reader.hash()?;
        reader.finish()?;

        let refreshed = self
            .refreshed
            .ok_or_else(|| EngineError::Internal("refreshed share not computed".into()))?;
        let device_public = ProjectivePoint::GENERATOR * refreshed;
        if confirmation != schnorr::refresh_confirmation(&self.session_id, &self.joint, &device_public)
        {
            return Err(EngineError::Rejected(
                "cosigner confirmed a different refresh".into(),
            ));
        }

        let share_data = encode_share(&refreshed, &(self.joint - device_public))?;

        debug!(session_id = %self.session_id, "Loopback share refresh finished");
        Ok(KeyMaterial {
            share_data,
            public_key: schnorr::encode_point(&self.joint),
        })
    }
}

impl EngineSession for RefreshSession {
    type Output = KeyMaterial;

    fn initial_message(&mut self) -> Result<Vec<u8>, EngineError> {
        let mut out = schnorr::encode_point(&self.joint);
        out.extend_from_slice(&schnorr::encode_point(&(self.joint - self.peer_public)));
        out.extend_from_slice(&schnorr::commit(&self.seed, &self.blind));
        Ok(out)
    }

    fn process(
        &mut self,
        round: u32,
        payload: &[u8],
    ) -> Result<RoundOutcome<KeyMaterial>, EngineError> {
        match round {
            1 => {
                let mut reader = Reader::new(payload, "refresh commitment");
                self.peer_commitment = Some(reader.hash()?);
                reader.finish()?;

                let mut reveal = self.seed.to_vec();
                reveal.extend_from_slice(&self.blind);
                Ok(RoundOutcome::Continue(reveal))
            }
            2 => Ok(RoundOutcome::Continue(self.apply_delta(payload)?)),
            PROTOCOL_ROUNDS => Ok(RoundOutcome::Finished(self.finish(payload)?)),
            other => Err(unexpected_round(other)),
        }
    }

    fn release(&mut self) {
        self.secret.zeroize();
        self.refreshed.zeroize();
        self.seed.zeroize();
        self.blind.zeroize();
    }
}

struct SigningSession {
    session_id: SessionId,
    secret: Option<Scalar>,
    joint: ProjectivePoint,
    peer_public: ProjectivePoint,
    digest: [u8; 32],
    nonce: Option<Scalar>,
    nonce_point: ProjectivePoint,
    blind: [u8; 32],
    peer_commitment: Option<[u8; HASH_LEN]>,
    peer_nonce: Option<ProjectivePoint>,
    challenge: Option<Scalar>,
    partial: Option<Scalar>,
}

impl SigningSession {
    fn partial_signature(&mut self, payload: &[u8]) -> Result<Vec<u8>, EngineError> {
        let commitment = self
            .peer_commitment
            .ok_or_else(|| EngineError::Internal("missing cosigner nonce commitment".into()))?;

        let mut reader = Reader::new(payload, "nonce reveal");
        let point_bytes = reader.take(schnorr::POINT_LEN)?;
        let blind = reader.hash()?;
        reader.finish()?;

        schnorr::verify_commitment(&commitment, point_bytes, &blind)?;
        let peer_nonce = schnorr::decode_point(point_bytes)?;

        let (secret, nonce) = self
            .secret
            .zip(self.nonce)
            .ok_or_else(released)?;
        let nonce_sum = self.nonce_point + peer_nonce;
        let e = schnorr::challenge(&nonce_sum, &self.joint, &self.digest);
        let partial = nonce + e * secret;

        self.peer_nonce = Some(peer_nonce);
        self.challenge = Some(e);
        self.partial = Some(partial);
        Ok(schnorr::encode_scalar(&partial).to_vec())
    }

    fn combine(&mut self, payload: &[u8]) -> Result<SignatureOutput, EngineError> {
        let mut reader = Reader::new(payload, "partial signature");
        let peer_partial = reader.scalar()?;
        reader.finish()?;

        let (peer_nonce, e) = self
            .peer_nonce
            .zip(self.challenge)
            .ok_or_else(|| EngineError::Internal("nonce exchange incomplete".into()))?;
        let partial = self
            .partial
            .ok_or_else(|| EngineError::Internal("partial signature missing".into()))?;

        if ProjectivePoint::GENERATOR * peer_partial != peer_nonce + self.peer_public * e {
            return Err(EngineError::Rejected(
                "cosigner partial signature does not verify".into(),
            ));
        }

        let mut bytes = schnorr::encode_point(&(self.nonce_point + peer_nonce));
        bytes.extend_from_slice(&schnorr::encode_scalar(&(partial + peer_partial)));

        if !verify_signature(&schnorr::encode_point(&self.joint), &self.digest, &bytes) {
            return Err(EngineError::Internal("combined signature does not verify".into()));
        }

        debug!(session_id = %self.session_id, "Loopback signing finished");
        Ok(SignatureOutput { bytes })
    }
}

impl EngineSession for SigningSession {
    type Output = SignatureOutput;

    fn initial_message(&mut self) -> Result<Vec<u8>, EngineError> {
        let mut out = schnorr::encode_point(&self.joint);
        out.extend_from_slice(&schnorr::encode_point(&(self.joint - self.peer_public)));
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(&schnorr::commit(
            &schnorr::encode_point(&self.nonce_point),
            &self.blind,
        ));
        Ok(out)
    }

    fn process(
        &mut self,
        round: u32,
        payload: &[u8],
    ) -> Result<RoundOutcome<SignatureOutput>, EngineError> {
        match round {
            1 => {
                let mut reader = Reader::new(payload, "nonce commitment");
                self.peer_commitment = Some(reader.hash()?);
                reader.finish()?;

                let mut reveal = schnorr::encode_point(&self.nonce_point);
                reveal.extend_from_slice(&self.blind);
                Ok(RoundOutcome::Continue(reveal))
            }
            2 => Ok(RoundOutcome::Continue(self.partial_signature(payload)?)),
            PROTOCOL_ROUNDS => Ok(RoundOutcome::Finished(self.combine(payload)?)),
            other => Err(unexpected_round(other)),
        }
    }

    fn release(&mut self) {
        self.secret.zeroize();
        self.nonce.zeroize();
        self.partial.zeroize();
        self.blind.zeroize();
    }
}
