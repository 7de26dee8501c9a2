//! Active-session table
//!
//! A single mutex guards every session of a manager. Engine calls run while
//! it is held; transport waits never do.

use super::state::{MpcSession, SessionState};
use crate::types::SessionId;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;

struct Entry {
    session: MpcSession,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Entry>,
    /// Profile id to its running keygen or rotation session
    exclusive: HashMap<String, SessionId>,
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session, refusing a second exclusive session for its profile
    pub fn register(&self, session: MpcSession, cancel: watch::Sender<bool>) -> Result<()> {
        let mut inner = self.inner.lock();

        if session.kind().is_exclusive() {
            if let Some(profile_id) = session.profile_id() {
                if let Some(active) = inner.exclusive.get(profile_id) {
                    return Err(Error::SessionConflict {
                        profile_id: profile_id.to_string(),
                        active: active.clone(),
                    });
                }
                inner
                    .exclusive
                    .insert(profile_id.to_string(), session.id().clone());
            }
        }

        inner
            .sessions
            .insert(session.id().clone(), Entry { session, cancel });
        Ok(())
    }

    /// Run `f` against a registered session under the table lock
    pub fn with_session<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut MpcSession) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        let entry = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionCancelled(id.to_string()))?;
        f(&mut entry.session)
    }

    /// Remove a session; the caller drops it outside the lock
    pub fn remove(&self, id: &str) -> Option<MpcSession> {
        self.take(id, false)
    }

    /// Fail, remove and signal a session; false if it was not registered
    pub fn cancel(&self, id: &str) -> bool {
        let Some(mut session) = self.take(id, true) else {
            return false;
        };
        session.fail();
        true
    }

    fn take(&self, id: &str, signal: bool) -> Option<MpcSession> {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.remove(id)?;
        if let Some(profile_id) = entry.session.profile_id() {
            if inner.exclusive.get(profile_id).map(String::as_str) == Some(id) {
                inner.exclusive.remove(profile_id);
            }
        }
        if signal {
            let _ = entry.cancel.send(true);
        }
        Some(entry.session)
    }

    pub fn state(&self, id: &str) -> Option<SessionState> {
        self.inner.lock().sessions.get(id).map(|e| e.session.state())
    }

    pub fn exclusive_session(&self, profile_id: &str) -> Option<SessionId> {
        self.inner.lock().exclusive.get(profile_id).cloned()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.inner.lock().sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }
}
