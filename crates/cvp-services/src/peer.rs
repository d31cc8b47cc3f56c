//! The peer side of a session, as seen by the coordinator.
//!
//! A `PeerLink` is owned by exactly one session and is only ever driven
//! from the coordinator loop, so implementations must not block.

use cvp_core::{Payload, Verdict};

/// How much more input the peer may deliver before asking again.
///
/// The budget is checked between chunks, never inside one: a chunk larger
/// than what is left is delivered whole and then input pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputBudget {
    Bytes(u64),
    Unlimited,
}

/// Direction a clear-to-send signal refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Peer → server.
    Source,
    /// Server → peer.
    Destination,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The outbound path is full. Retry on the next clear-to-send.
    #[error("peer is not ready to accept data")]
    Backpressure,
    #[error("peer link closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("peer link closed")]
    Closed,
    #[error("peer rejected request: {0}")]
    Rejected(String),
}

pub trait PeerLink: Send {
    /// Hand one chunk (or the end marker) to the peer.
    fn send_chunk(&mut self, payload: &Payload) -> Result<(), SendError>;

    /// Must be called once, before any chunk.
    fn send_verdict(&mut self, verdict: &Verdict) -> Result<(), PeerError>;

    /// Replace the input budget. Granularity is one whole chunk; see
    /// `InputBudget`.
    fn request_more_input(&mut self, budget: InputBudget) -> Result<(), PeerError>;

    fn suspend_input(&mut self);

    fn resume_input(&mut self);

    /// Largest chunk the peer accepts per send.
    fn max_chunk_size(&self) -> usize {
        usize::MAX
    }

    /// End the session from our side.
    fn close(&mut self);
}
