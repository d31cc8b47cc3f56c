//! Registry of sessions that are ending.
//!
//! A session enters the registry when the coordinator tears down its state
//! and leaves it when the worker's final `WorkerExited` is processed. In
//! between, any message from that worker is discarded unread.

use std::collections::HashSet;

use cvp_core::SessionId;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    ending: HashSet<SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the session's coordinator state is gone.
    pub fn mark_ending(&mut self, session: SessionId) {
        if !self.ending.insert(session) {
            tracing::warn!(%session, "session already marked as ending");
        }
    }

    pub fn is_ending(&self, session: SessionId) -> bool {
        self.ending.contains(&session)
    }

    /// Forget the session once its worker has exited. Returns whether an
    /// entry was removed.
    pub fn clear(&mut self, session: SessionId) -> bool {
        self.ending.remove(&session)
    }

    pub fn len(&self) -> usize {
        self.ending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ending.is_empty()
    }

    /// Sessions still waiting for their worker to exit.
    pub fn pending(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.ending.iter().copied()
    }
}
