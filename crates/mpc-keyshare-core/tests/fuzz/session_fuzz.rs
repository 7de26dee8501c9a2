//! Fuzz tests for session round ordering
//!
//! Feeds arbitrary inbound round sequences to a session and checks them
//! against a reference model of the state machine.

use crate::support::ScriptedEngine;
use mpc_keyshare_core::{
    engine::{EngineHandle, ProtocolEngine},
    session::{Advance, MpcSession},
    Algorithm, Error, MessageType, ProtocolMessage, SessionKind, SessionState,
};
use proptest::prelude::*;

const ROUNDS: u32 = 3;

fn session(engine: &ScriptedEngine) -> MpcSession {
    let handle = engine
        .keygen(Algorithm::Ecdsa, &[], &"fuzz".to_string())
        .unwrap();
    MpcSession::new(
        "fuzz".into(),
        SessionKind::KeyGeneration,
        Some("p".into()),
        EngineHandle::KeyGen(handle),
    )
}

proptest! {
    #[test]
    fn round_order_matches_model(inbound in prop::collection::vec(0u32..6, 1..24)) {
        let engine = ScriptedEngine::new(ROUNDS);
        let mut session = session(&engine);
        session.start().unwrap();
        let mut current = 1u32;

        for round in inbound {
            let message = ProtocolMessage::new("fuzz", round, MessageType::Keygen, vec![round as u8]);
            let result = session.advance(&message);

            if round < current {
                prop_assert!(matches!(result, Ok(Advance::Stale)));
                prop_assert_eq!(session.current_round(), current);
                prop_assert_eq!(session.state(), SessionState::RoundInProgress(current));
            } else if round > current {
                let is_desync = matches!(
                    result,
                    Err(Error::ProtocolDesync { expected, received, .. })
                        if expected == current && received == round
                );
                prop_assert!(is_desync);
                prop_assert_eq!(session.state(), SessionState::Failed);
                break;
            } else if current == ROUNDS {
                prop_assert!(matches!(result, Ok(Advance::Finished(_))));
                prop_assert_eq!(session.state(), SessionState::Completed);
                break;
            } else {
                let next = match result {
                    Ok(Advance::Next(next)) => next,
                    _ => return Err(TestCaseError::fail("expected next round")),
                };
                prop_assert_eq!(next.round, current + 1);
                current += 1;
                prop_assert_eq!(session.current_round(), current);
            }
        }

        let live = !session.state().is_terminal();
        prop_assert_eq!(engine.release_count(), usize::from(!live));
        drop(session);
        prop_assert_eq!(engine.release_count(), 1);
    }

    #[test]
    fn terminal_sessions_accept_nothing(round in 0u32..10) {
        let engine = ScriptedEngine::new(1);
        let mut session = session(&engine);
        session.start().unwrap();
        session
            .advance(&ProtocolMessage::new("fuzz", 1, MessageType::Keygen, vec![]))
            .unwrap();
        prop_assert_eq!(session.state(), SessionState::Completed);

        let result = session.advance(&ProtocolMessage::new("fuzz", round, MessageType::Keygen, vec![]));
        prop_assert!(matches!(result, Err(Error::Internal(_))));
        prop_assert_eq!(session.state(), SessionState::Completed);
    }
}
