//! In-process cosigner speaking the loopback protocol
//!
//! [`LoopbackCosigner`] implements [`Transport`], answering each device
//! message with its own message for the same round. Replies are cached per
//! `(session_id, round)` so re-sent messages get the same answer; a finished
//! session keeps only its final reply, in a bounded cache. Injected
//! [`CosignerFault`]s make it misbehave on purpose.

use super::schnorr::{self, Reader, COSIGNER_PARTY, DEVICE_PARTY, HASH_LEN};
use super::loopback::PROTOCOL_ROUNDS;
use super::EngineError;
use crate::transport::{Transport, TransportError};
use crate::types::{MessageType, ProtocolMessage, SessionId};
use async_trait::async_trait;
use dashmap::DashMap;
use k256::{ProjectivePoint, Scalar};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Final replies kept for sessions that already finished
const FINISHED_REPLY_CACHE: usize = 64;

/// Deliberate misbehaviour, consumed once per matching reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CosignerFault {
    /// Corrupt the last byte of the reply payload
    Tamper { message_type: MessageType, round: u32 },
    /// Answer with the previous round's number `times` times in a row
    ReplayStale {
        message_type: MessageType,
        round: u32,
        times: u32,
    },
    /// Label the reply with the next round
    SkipAhead { message_type: MessageType, round: u32 },
}

impl CosignerFault {
    fn matches(&self, message: &ProtocolMessage) -> bool {
        let (message_type, round) = match *self {
            CosignerFault::Tamper {
                message_type,
                round,
            }
            | CosignerFault::ReplayStale {
                message_type,
                round,
                ..
            }
            | CosignerFault::SkipAhead {
                message_type,
                round,
            } => (message_type, round),
        };
        message.message_type == message_type && message.round == round
    }

    fn uses(&self) -> u32 {
        match self {
            CosignerFault::ReplayStale { times, .. } => *times,
            _ => 1,
        }
    }
}

struct ActiveFault {
    fault: CosignerFault,
    remaining: u32,
}

/// Cosigner half of a key: `x2` and the device's public share `X1`
#[derive(Clone)]
struct CosignerKey {
    secret: Scalar,
    device_public: ProjectivePoint,
}

impl Drop for CosignerKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Share generations of one joint key, newest last
///
/// A refresh keeps its base generation next to the new one until the device
/// signs with the new share, since the device may fail to persist it.
#[derive(Default)]
struct KeyGenerations(Vec<CosignerKey>);

impl KeyGenerations {
    fn position(&self, device_public: &ProjectivePoint) -> Option<usize> {
        self.0.iter().position(|k| k.device_public == *device_public)
    }
}

enum Flow {
    Keygen {
        secret: Scalar,
        public: ProjectivePoint,
        blind: [u8; 32],
        device_commitment: Option<[u8; HASH_LEN]>,
        joint: Option<ProjectivePoint>,
    },
    Refresh {
        base: CosignerKey,
        joint: ProjectivePoint,
        seed: [u8; 32],
        blind: [u8; 32],
        device_commitment: [u8; HASH_LEN],
        refreshed: Option<CosignerKey>,
    },
    Sign {
        secret: Scalar,
        device_public: ProjectivePoint,
        joint: ProjectivePoint,
        digest: [u8; 32],
        nonce: Scalar,
        nonce_point: ProjectivePoint,
        blind: [u8; 32],
        device_commitment: [u8; HASH_LEN],
        device_nonce: Option<ProjectivePoint>,
        challenge: Option<Scalar>,
        partial: Option<Scalar>,
    },
}

impl Drop for Flow {
    fn drop(&mut self) {
        match self {
            Flow::Keygen { secret, blind, .. } => {
                secret.zeroize();
                blind.zeroize();
            }
            Flow::Refresh { seed, blind, .. } => {
                seed.zeroize();
                blind.zeroize();
            }
            Flow::Sign {
                secret,
                nonce,
                blind,
                partial,
                ..
            } => {
                secret.zeroize();
                nonce.zeroize();
                blind.zeroize();
                partial.zeroize();
            }
        }
    }
}

struct CosignerSession {
    message_type: MessageType,
    next_round: u32,
    flow: Option<Flow>,
    replies: HashMap<u32, ProtocolMessage>,
}

/// Remote party of the loopback protocol
pub struct LoopbackCosigner {
    identity: Scalar,
    keys: DashMap<String, KeyGenerations>,
    sessions: DashMap<SessionId, CosignerSession>,
    finished: Mutex<VecDeque<ProtocolMessage>>,
    faults: Mutex<Vec<ActiveFault>>,
    closed: AtomicBool,
}

impl Default for LoopbackCosigner {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackCosigner {
    pub fn new() -> Self {
        Self {
            identity: schnorr::random_scalar(),
            keys: DashMap::new(),
            sessions: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            faults: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Compressed identity public key devices bind their proofs to
    pub fn public_key(&self) -> Vec<u8> {
        schnorr::encode_point(&(ProjectivePoint::GENERATOR * self.identity))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Queue a fault for the next matching reply
    pub fn inject(&self, fault: CosignerFault) {
        self.faults.lock().push(ActiveFault {
            remaining: fault.uses(),
            fault,
        });
    }

    pub fn with_fault(self, fault: CosignerFault) -> Self {
        self.inject(fault);
        self
    }

    /// Stop answering; every later exchange fails with `Closed`
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.sessions.clear();
            self.finished.lock().clear();
            info!("Loopback cosigner shut down");
        }
    }

    /// Number of joint keys this cosigner holds a share of
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Share generations held for the compressed joint key
    pub fn generation_count(&self, public_key_hex: &str) -> usize {
        self.keys
            .get(&public_key_hex.to_ascii_lowercase())
            .map_or(0, |g| g.0.len())
    }

    /// Whether the cosigner holds a share for the compressed joint key
    pub fn holds_key(&self, public_key_hex: &str) -> bool {
        self.keys.contains_key(&public_key_hex.to_ascii_lowercase())
    }

    /// Sessions started but not yet finished or failed
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn finished_reply(&self, message: &ProtocolMessage) -> Option<ProtocolMessage> {
        self.finished
            .lock()
            .iter()
            .find(|r| r.session_id == message.session_id && r.round == message.round)
            .cloned()
    }

    fn respond(&self, message: &ProtocolMessage) -> Result<ProtocolMessage, TransportError> {
        if let Some(reply) = self.finished_reply(message) {
            debug!(session_id = %message.session_id, round = message.round, "Replaying final reply");
            return Ok(reply);
        }

        let result = self.advance(message);
        match &result {
            Ok(reply) if reply.round >= PROTOCOL_ROUNDS => {
                self.sessions.remove(&message.session_id);
                let mut finished = self.finished.lock();
                if finished.len() >= FINISHED_REPLY_CACHE {
                    finished.pop_front();
                }
                finished.push_back(reply.clone());
            }
            Ok(_) => {}
            Err(_) => {
                self.sessions.remove(&message.session_id);
            }
        }
        result
    }

    fn advance(&self, message: &ProtocolMessage) -> Result<ProtocolMessage, TransportError> {
        let mut session = self
            .sessions
            .entry(message.session_id.clone())
            .or_insert_with(|| CosignerSession {
                message_type: message.message_type,
                next_round: 1,
                flow: None,
                replies: HashMap::new(),
            });

        if session.message_type != message.message_type {
            return Err(bad_request(format!(
                "session {} is a {:?} session",
                message.session_id, session.message_type
            )));
        }
        if let Some(reply) = session.replies.get(&message.round) {
            debug!(session_id = %message.session_id, round = message.round, "Replaying cached reply");
            return Ok(reply.clone());
        }
        if message.round != session.next_round {
            return Err(TransportError::Backend {
                status: 409,
                message: format!(
                    "expected round {}, got {}",
                    session.next_round, message.round
                ),
            });
        }

        let payload = match message.message_type {
            MessageType::Keygen => self.keygen_round(&mut session, message),
            MessageType::Rotation => self.refresh_round(&mut session, message),
            MessageType::Sign => self.sign_round(&mut session, message),
        }
        .map_err(|e| match e {
            EngineError::Malformed(reason) => bad_request(reason),
            EngineError::Rejected(reason) => {
                warn!(session_id = %message.session_id, %reason, "Cosigner rejected device message");
                TransportError::Backend {
                    status: 422,
                    message: reason,
                }
            }
            EngineError::Internal(reason) => TransportError::Backend {
                status: 500,
                message: reason,
            },
        })?;

        let reply = ProtocolMessage::new(
            message.session_id.clone(),
            message.round,
            message.message_type,
            payload,
        );
        session.replies.insert(message.round, reply.clone());
        session.next_round += 1;
        Ok(reply)
    }

    fn keygen_round(
        &self,
        session: &mut CosignerSession,
        message: &ProtocolMessage,
    ) -> Result<Vec<u8>, EngineError> {
        match message.round {
            1 => {
                let mut reader = Reader::new(&message.payload, "keygen commitment");
                let commitment = reader.hash()?;
                reader.finish()?;

                let secret = schnorr::random_scalar();
                let public = ProjectivePoint::GENERATOR * secret;
                let blind = schnorr::random_blind();
                let reply = schnorr::commit(&schnorr::encode_point(&public), &blind).to_vec();
                session.flow = Some(Flow::Keygen {
                    secret,
                    public,
                    blind,
                    device_commitment: Some(commitment),
                    joint: None,
                });
                Ok(reply)
            }
            2 => {
                let Some(Flow::Keygen {
                    secret,
                    public,
                    blind,
                    device_commitment: Some(commitment),
                    joint,
                }) = session.flow.as_mut()
                else {
                    return Err(EngineError::Internal("keygen state missing".into()));
                };

                let mut reader = Reader::new(&message.payload, "keygen reveal");
                let point_bytes = reader.take(schnorr::POINT_LEN)?;
                let device_blind = reader.hash()?;
                let proof = reader.take(schnorr::PROOF_LEN)?;
                reader.finish()?;

                schnorr::verify_commitment(commitment, point_bytes, &device_blind)?;
                let device_public = schnorr::decode_point(point_bytes)?;
                let cloud = self.public_key();
                let device_ctx =
                    schnorr::proof_context(&message.session_id, &cloud, DEVICE_PARTY);
                schnorr::verify_proof(proof, &device_public, &device_ctx)?;

                *joint = Some(*public + device_public);

                let ctx = schnorr::proof_context(&message.session_id, &cloud, COSIGNER_PARTY);
                let mut reply = schnorr::encode_point(public);
                reply.extend_from_slice(&blind[..]);
                reply.extend_from_slice(&schnorr::prove(secret, public, &ctx));
                Ok(reply)
            }
            3 => {
                let Some(Flow::Keygen {
                    secret,
                    public,
                    joint: Some(joint),
                    ..
                }) = session.flow.as_ref()
                else {
                    return Err(EngineError::Internal("keygen state missing".into()));
                };

                let mut reader = Reader::new(&message.payload, "keygen confirmation");
                let confirmation = reader.hash()?;
                reader.finish()?;

                let expected = schnorr::confirmation(&message.session_id, joint);
                if confirmation != expected {
                    return Err(EngineError::Rejected(
                        "device derived a different joint key".into(),
                    ));
                }

                self.keys.insert(
                    hex::encode(schnorr::encode_point(joint)),
                    KeyGenerations(vec![CosignerKey {
                        secret: *secret,
                        device_public: *joint - *public,
                    }]),
                );
                debug!(session_id = %message.session_id, "Cosigner stored key share");
                Ok(expected.to_vec())
            }
            other => Err(EngineError::Internal(format!("no handler for round {other}"))),
        }
    }

    fn sign_round(
        &self,
        session: &mut CosignerSession,
        message: &ProtocolMessage,
    ) -> Result<Vec<u8>, EngineError> {
        match message.round {
            1 => {
                let mut reader = Reader::new(&message.payload, "signing request");
                let joint_bytes = reader.take(schnorr::POINT_LEN)?;
                let device_public = reader.point()?;
                let digest = reader.hash()?;
                let device_commitment = reader.hash()?;
                reader.finish()?;

                let joint = schnorr::decode_point(joint_bytes)?;
                let key = self.signing_key(&hex::encode(joint_bytes), &device_public)?;

                let nonce = schnorr::random_scalar();
                let nonce_point = ProjectivePoint::GENERATOR * nonce;
                let blind = schnorr::random_blind();
                let reply = schnorr::commit(&schnorr::encode_point(&nonce_point), &blind).to_vec();

                session.flow = Some(Flow::Sign {
                    secret: key.secret,
                    device_public: key.device_public,
                    joint,
                    digest,
                    nonce,
                    nonce_point,
                    blind,
                    device_commitment,
                    device_nonce: None,
                    challenge: None,
                    partial: None,
                });
                Ok(reply)
            }
            2 => {
                let Some(Flow::Sign {
                    secret,
                    joint,
                    digest,
                    nonce,
                    nonce_point,
                    blind,
                    device_commitment,
                    device_nonce,
                    challenge,
                    partial,
                    ..
                }) = session.flow.as_mut()
                else {
                    return Err(EngineError::Internal("signing state missing".into()));
                };

                let mut reader = Reader::new(&message.payload, "nonce reveal");
                let point_bytes = reader.take(schnorr::POINT_LEN)?;
                let device_blind = reader.hash()?;
                reader.finish()?;

                schnorr::verify_commitment(device_commitment, point_bytes, &device_blind)?;
                let their_nonce = schnorr::decode_point(point_bytes)?;

                let e = schnorr::challenge(&(*nonce_point + their_nonce), joint, digest);
                *partial = Some(*nonce + e * *secret);
                *challenge = Some(e);
                *device_nonce = Some(their_nonce);

                let mut reply = schnorr::encode_point(nonce_point);
                reply.extend_from_slice(&blind[..]);
                Ok(reply)
            }
            3 => {
                let Some(Flow::Sign {
                    device_public,
                    device_nonce: Some(device_nonce),
                    challenge: Some(e),
                    partial: Some(partial),
                    ..
                }) = session.flow.as_ref()
                else {
                    return Err(EngineError::Internal("signing state missing".into()));
                };

                let mut reader = Reader::new(&message.payload, "partial signature");
                let device_partial = reader.scalar()?;
                reader.finish()?;

                if ProjectivePoint::GENERATOR * device_partial != *device_nonce + *device_public * *e
                {
                    return Err(EngineError::Rejected(
                        "device partial signature does not verify".into(),
                    ));
                }
                Ok(schnorr::encode_scalar(partial).to_vec())
            }
            other => Err(EngineError::Internal(format!("no handler for round {other}"))),
        }
    }

    /// Generation matching `device_public`; signing with the newest share
    /// retires the older ones
    fn signing_key(
        &self,
        joint_hex: &str,
        device_public: &ProjectivePoint,
    ) -> Result<CosignerKey, EngineError> {
        let mut generations = self
            .keys
            .get_mut(joint_hex)
            .ok_or_else(|| EngineError::Rejected("unknown signing key".into()))?;
        let index = generations
            .position(device_public)
            .ok_or_else(|| EngineError::Rejected("unknown share generation".into()))?;

        let key = generations.0[index].clone();
        if index + 1 == generations.0.len() && index > 0 {
            generations.0.drain(..index);
            debug!(joint_key = %joint_hex, "Retired refreshed-away share generations");
        }
        Ok(key)
    }

    fn refresh_round(
        &self,
        session: &mut CosignerSession,
        message: &ProtocolMessage,
    ) -> Result<Vec<u8>, EngineError> {
        match message.round {
            1 => {
                let mut reader = Reader::new(&message.payload, "refresh request");
                let joint_bytes = reader.take(schnorr::POINT_LEN)?;
                let device_public = reader.point()?;
                let device_commitment = reader.hash()?;
                reader.finish()?;

                let joint = schnorr::decode_point(joint_bytes)?;
                let base = {
                    let generations = self
                        .keys
                        .get(&hex::encode(joint_bytes))
                        .ok_or_else(|| EngineError::Rejected("unknown key to refresh".into()))?;
                    let index = generations
                        .position(&device_public)
                        .ok_or_else(|| EngineError::Rejected("unknown share generation".into()))?;
                    generations.0[index].clone()
                };

                let seed = schnorr::random_blind();
                let blind = schnorr::random_blind();
                let reply = schnorr::commit(&seed, &blind).to_vec();
                session.flow = Some(Flow::Refresh {
                    base,
                    joint,
                    seed,
                    blind,
                    device_commitment,
                    refreshed: None,
                });
                Ok(reply)
            }
            2 => {
                let Some(Flow::Refresh {
                    base,
                    joint,
                    seed,
                    blind,
                    device_commitment,
                    refreshed,
                }) = session.flow.as_mut()
                else {
                    return Err(EngineError::Internal("refresh state missing".into()));
                };

                let mut reader = Reader::new(&message.payload, "refresh reveal");
                let device_seed = reader.hash()?;
                let device_blind = reader.hash()?;
                reader.finish()?;
                schnorr::verify_commitment(device_commitment, &device_seed, &device_blind)?;

                let delta = schnorr::refresh_delta(&message.session_id, joint, &device_seed, &seed[..]);
                *refreshed = Some(CosignerKey {
                    secret: base.secret - delta,
                    device_public: base.device_public + ProjectivePoint::GENERATOR * delta,
                });

                let mut reply = seed.to_vec();
                reply.extend_from_slice(&blind[..]);
                Ok(reply)
            }
            3 => {
                let Some(Flow::Refresh {
                    base,
                    joint,
                    refreshed: Some(refreshed),
                    ..
                }) = session.flow.as_ref()
                else {
                    return Err(EngineError::Internal("refresh state missing".into()));
                };

                let mut reader = Reader::new(&message.payload, "refresh confirmation");
                let confirmation = reader.hash()?;
                reader.finish()?;

                let expected =
                    schnorr::refresh_confirmation(&message.session_id, joint, &refreshed.device_public);
                if confirmation != expected {
                    return Err(EngineError::Rejected(
                        "device confirmed a different refresh".into(),
                    ));
                }

                self.keys.insert(
                    hex::encode(schnorr::encode_point(joint)),
                    KeyGenerations(vec![base.clone(), refreshed.clone()]),
                );
                debug!(session_id = %message.session_id, "Cosigner refreshed key share");
                Ok(expected.to_vec())
            }
            other => Err(EngineError::Internal(format!("no handler for round {other}"))),
        }
    }

    fn apply_faults(&self, mut reply: ProtocolMessage, request: &ProtocolMessage) -> ProtocolMessage {
        let mut faults = self.faults.lock();
        let Some(index) = faults
            .iter()
            .position(|f| f.remaining > 0 && f.fault.matches(request))
        else {
            return reply;
        };

        let active = &mut faults[index];
        active.remaining -= 1;
        let fault = active.fault;
        if active.remaining == 0 {
            faults.remove(index);
        }

        warn!(?fault, session_id = %request.session_id, "Cosigner injecting fault");
        match fault {
            CosignerFault::Tamper { .. } => {
                if let Some(last) = reply.payload.last_mut() {
                    *last ^= 0x01;
                }
            }
            CosignerFault::ReplayStale { .. } => {
                reply.round = request.round.saturating_sub(1);
            }
            CosignerFault::SkipAhead { .. } => {
                reply.round = request.round + 1;
            }
        }
        reply
    }
}

fn bad_request(message: String) -> TransportError {
    TransportError::Backend {
        status: 400,
        message,
    }
}

#[async_trait]
impl Transport for LoopbackCosigner {
    async fn send(&self, message: ProtocolMessage) -> Result<ProtocolMessage, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let reply = self.respond(&message)?;
        Ok(self.apply_faults(reply, &message))
    }
}
