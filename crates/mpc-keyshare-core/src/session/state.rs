//! Per-session state machine
//!
//! ```text
//! Created -> RoundInProgress(1) -> ... -> RoundInProgress(n) -> Completed
//!                    \                          \
//!                     `--------------------------`--> Failed
//! ```

use crate::engine::{EngineHandle, KeyMaterial, RoundOutcome, SignatureOutput};
use crate::types::{ProtocolMessage, SessionId, SessionKind};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, warn};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    /// Round `n` sent, waiting for the counterparty's round-`n` message
    RoundInProgress(u32),
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::RoundInProgress(round) => write!(f, "round {round} in progress"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Finished engine result
#[derive(Debug)]
pub enum SessionOutput {
    KeyMaterial(KeyMaterial),
    Signature(SignatureOutput),
}

/// Effect of feeding one inbound message
#[derive(Debug)]
pub enum Advance {
    /// Message from an earlier round; discarded, state unchanged
    Stale,
    /// Deliver this message for the next round
    Next(ProtocolMessage),
    Finished(SessionOutput),
}

/// In-memory state of one protocol run
pub struct MpcSession {
    id: SessionId,
    kind: SessionKind,
    profile_id: Option<String>,
    current_round: u32,
    max_rounds: u32,
    state: SessionState,
    handle: Option<EngineHandle>,
    created_at: DateTime<Utc>,
}

impl MpcSession {
    pub fn new(
        id: SessionId,
        kind: SessionKind,
        profile_id: Option<String>,
        handle: EngineHandle,
    ) -> Self {
        Self {
            id,
            kind,
            profile_id,
            current_round: 1,
            max_rounds: kind.max_rounds(),
            state: SessionState::Created,
            handle: Some(handle),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn profile_id(&self) -> Option<&str> {
        self.profile_id.as_deref()
    }

    pub fn current_round(&self) -> u32 {
        self.current_round
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn message(&self, payload: Vec<u8>) -> ProtocolMessage {
        ProtocolMessage::new(
            self.id.clone(),
            self.current_round,
            self.kind.message_type(),
            payload,
        )
    }

    /// Produce the round-1 outbound message
    pub fn start(&mut self) -> Result<ProtocolMessage> {
        if self.state != SessionState::Created {
            return Err(Error::Internal(format!(
                "session {} already started ({})",
                self.id, self.state
            )));
        }

        let payload = match self.handle.as_mut() {
            Some(EngineHandle::KeyGen(engine)) => engine.initial_message(),
            Some(EngineHandle::Sign(engine)) => engine.initial_message(),
            None => return Err(Error::SessionCancelled(self.id.clone())),
        };

        match payload {
            Ok(payload) => {
                self.state = SessionState::RoundInProgress(self.current_round);
                Ok(self.message(payload))
            }
            Err(e) => {
                self.fail();
                Err(e.into())
            }
        }
    }

    /// Feed the counterparty's message for the current round
    pub fn advance(&mut self, inbound: &ProtocolMessage) -> Result<Advance> {
        let SessionState::RoundInProgress(round) = self.state else {
            return Err(Error::Internal(format!(
                "session {} cannot accept messages while {}",
                self.id, self.state
            )));
        };

        if inbound.session_id != self.id {
            self.fail();
            return Err(Error::MalformedMessage(format!(
                "message for session {} delivered to session {}",
                inbound.session_id, self.id
            )));
        }
        if inbound.message_type != self.kind.message_type() {
            self.fail();
            return Err(Error::MalformedMessage(format!(
                "{:?} message in a {} session",
                inbound.message_type, self.kind
            )));
        }

        if inbound.round < round {
            debug!(
                session_id = %self.id,
                current = round,
                received = inbound.round,
                "Discarding stale message"
            );
            return Ok(Advance::Stale);
        }
        if inbound.round > round {
            warn!(
                session_id = %self.id,
                current = round,
                received = inbound.round,
                "Counterparty ahead of local round"
            );
            self.fail();
            return Err(self.desync(round, inbound.round));
        }

        let outcome = match self.handle.as_mut() {
            Some(EngineHandle::KeyGen(engine)) => engine
                .process(round, &inbound.payload)
                .map(|o| map_outcome(o, SessionOutput::KeyMaterial)),
            Some(EngineHandle::Sign(engine)) => engine
                .process(round, &inbound.payload)
                .map(|o| map_outcome(o, SessionOutput::Signature)),
            None => return Err(Error::SessionCancelled(self.id.clone())),
        };

        match outcome {
            Ok(RoundOutcome::Continue(payload)) => {
                if round >= self.max_rounds {
                    self.fail();
                    return Err(self.desync(self.max_rounds, round + 1));
                }
                self.current_round = round + 1;
                self.state = SessionState::RoundInProgress(self.current_round);
                Ok(Advance::Next(self.message(payload)))
            }
            Ok(RoundOutcome::Finished(output)) => {
                self.state = SessionState::Completed;
                self.release();
                Ok(Advance::Finished(output))
            }
            Err(e) => {
                self.fail();
                Err(e.into())
            }
        }
    }

    /// Mark the session failed and release engine state
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
        }
        self.release();
    }

    fn desync(&self, expected: u32, received: u32) -> Error {
        Error::ProtocolDesync {
            session_id: self.id.clone(),
            expected,
            received,
        }
    }

    fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        }
    }
}

fn map_outcome<T>(outcome: RoundOutcome<T>, wrap: fn(T) -> SessionOutput) -> RoundOutcome<SessionOutput> {
    match outcome {
        RoundOutcome::Continue(payload) => RoundOutcome::Continue(payload),
        RoundOutcome::Finished(output) => RoundOutcome::Finished(wrap(output)),
    }
}

impl Drop for MpcSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpcSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("profile_id", &self.profile_id)
            .field("current_round", &self.current_round)
            .field("max_rounds", &self.max_rounds)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .finish()
    }
}
