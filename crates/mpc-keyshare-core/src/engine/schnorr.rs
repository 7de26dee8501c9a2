//! secp256k1 building blocks shared by the loopback engine and cosigner

use super::EngineError;
use k256::{
    AffinePoint, EncodedPoint, ProjectivePoint, Scalar,
    elliptic_curve::{
        Field,
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
    },
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

pub const POINT_LEN: usize = 33;
pub const SCALAR_LEN: usize = 32;
pub const HASH_LEN: usize = 32;
pub const PROOF_LEN: usize = POINT_LEN + SCALAR_LEN;

/// Party tag mixed into proof contexts
pub const DEVICE_PARTY: u8 = 1;
pub const COSIGNER_PARTY: u8 = 2;

pub fn random_scalar() -> Scalar {
    Scalar::random(&mut OsRng)
}

pub fn random_blind() -> [u8; 32] {
    rand::random()
}

/// SHA-256 over length-prefixed parts under a domain tag
pub fn hash(domain: &str, parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn hash_to_scalar(domain: &str, parts: &[&[u8]]) -> Scalar {
    let digest = hash(domain, parts);
    <Scalar as Reduce<U256>>::reduce_bytes(&digest.into())
}

pub fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

pub fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, EngineError> {
    if bytes.len() != POINT_LEN {
        return Err(EngineError::Malformed(format!(
            "point must be {} bytes, got {}",
            POINT_LEN,
            bytes.len()
        )));
    }
    let encoded = EncodedPoint::from_bytes(bytes)
        .map_err(|e| EngineError::Malformed(e.to_string()))?;
    let affine: AffinePoint = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| EngineError::Malformed("point is not on the curve".into()))?;
    Ok(ProjectivePoint::from(affine))
}

pub fn encode_scalar(scalar: &Scalar) -> [u8; SCALAR_LEN] {
    scalar.to_bytes().into()
}

pub fn decode_scalar(bytes: &[u8]) -> Result<Scalar, EngineError> {
    let bytes: [u8; SCALAR_LEN] = bytes
        .try_into()
        .map_err(|_| EngineError::Malformed("scalar must be 32 bytes".into()))?;
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&bytes.into()))
}

/// Hiding commitment to an encoded point or seed
pub fn commit(value: &[u8], blind: &[u8; 32]) -> [u8; HASH_LEN] {
    hash("mpc-keyshare/loopback/commit", &[value, blind])
}

pub fn verify_commitment(
    commitment: &[u8; HASH_LEN],
    value: &[u8],
    blind: &[u8; 32],
) -> Result<(), EngineError> {
    if &commit(value, blind) != commitment {
        return Err(EngineError::Rejected(
            "revealed value does not open the commitment".into(),
        ));
    }
    Ok(())
}

/// Context binding a proof to one session, cosigner identity and party
pub fn proof_context(session_id: &str, cloud_public_key: &[u8], party: u8) -> [u8; HASH_LEN] {
    hash(
        "mpc-keyshare/loopback/pok-context",
        &[session_id.as_bytes(), cloud_public_key, &[party]],
    )
}

/// Schnorr proof of knowledge of `secret` for `public = secret * G`
pub fn prove(secret: &Scalar, public: &ProjectivePoint, context: &[u8]) -> Vec<u8> {
    let k = random_scalar();
    let t = ProjectivePoint::GENERATOR * k;
    let t_bytes = encode_point(&t);
    let c = hash_to_scalar(
        "mpc-keyshare/loopback/pok",
        &[context, &encode_point(public), &t_bytes],
    );
    let z = k + c * secret;

    let mut proof = t_bytes;
    proof.extend_from_slice(&encode_scalar(&z));
    proof
}

pub fn verify_proof(
    proof: &[u8],
    public: &ProjectivePoint,
    context: &[u8],
) -> Result<(), EngineError> {
    let mut reader = Reader::new(proof, "proof");
    let t_bytes = reader.take(POINT_LEN)?;
    let t = decode_point(t_bytes)?;
    let z = reader.scalar()?;
    reader.finish()?;

    let c = hash_to_scalar(
        "mpc-keyshare/loopback/pok",
        &[context, &encode_point(public), t_bytes],
    );
    if ProjectivePoint::GENERATOR * z != t + *public * c {
        return Err(EngineError::Rejected("proof of knowledge failed".into()));
    }
    Ok(())
}

/// Joint-key confirmation both parties must agree on
pub fn confirmation(session_id: &str, joint_key: &ProjectivePoint) -> [u8; HASH_LEN] {
    hash(
        "mpc-keyshare/loopback/confirm",
        &[session_id.as_bytes(), &encode_point(joint_key)],
    )
}

/// Refresh offset `delta` derived from both parties' seeds
///
/// The device adds `delta` to its share and the cosigner subtracts it, so
/// the joint key never changes.
pub fn refresh_delta(
    session_id: &str,
    joint_key: &ProjectivePoint,
    device_seed: &[u8],
    cosigner_seed: &[u8],
) -> Scalar {
    hash_to_scalar(
        "mpc-keyshare/loopback/refresh",
        &[
            session_id.as_bytes(),
            &encode_point(joint_key),
            device_seed,
            cosigner_seed,
        ],
    )
}

/// Confirmation of the refreshed device public share
pub fn refresh_confirmation(
    session_id: &str,
    joint_key: &ProjectivePoint,
    device_public: &ProjectivePoint,
) -> [u8; HASH_LEN] {
    hash(
        "mpc-keyshare/loopback/refresh-confirm",
        &[
            session_id.as_bytes(),
            &encode_point(joint_key),
            &encode_point(device_public),
        ],
    )
}

/// Signature challenge `e = H(R || P || m)`
pub fn challenge(nonce: &ProjectivePoint, joint_key: &ProjectivePoint, digest: &[u8; 32]) -> Scalar {
    hash_to_scalar(
        "mpc-keyshare/loopback/challenge",
        &[&encode_point(nonce), &encode_point(joint_key), digest],
    )
}

/// Sequential reader over a fixed payload layout
pub struct Reader<'a> {
    bytes: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8], what: &'static str) -> Self {
        Self { bytes, what }
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], EngineError> {
        if self.bytes.len() < len {
            return Err(EngineError::Malformed(format!("{} truncated", self.what)));
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    pub fn point(&mut self) -> Result<ProjectivePoint, EngineError> {
        decode_point(self.take(POINT_LEN)?)
    }

    pub fn scalar(&mut self) -> Result<Scalar, EngineError> {
        decode_scalar(self.take(SCALAR_LEN)?)
    }

    pub fn hash(&mut self) -> Result<[u8; HASH_LEN], EngineError> {
        let bytes = self.take(HASH_LEN)?;
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn finish(self) -> Result<(), EngineError> {
        if !self.bytes.is_empty() {
            return Err(EngineError::Malformed(format!(
                "{} has {} trailing bytes",
                self.what,
                self.bytes.len()
            )));
        }
        Ok(())
    }
}
