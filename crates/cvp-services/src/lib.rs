//! cvp-services: the inspection pipeline.
//!
//! A single coordinator loop owns every peer-facing session; each session
//! gets one worker thread that stages the payload in scratch storage. The
//! two sides talk only through mailboxes (`channel`), and the registry
//! keeps late worker messages away from sessions already torn down.

pub mod channel;
pub mod coordinator;
pub mod peer;
pub mod registry;
pub mod scratch;
pub mod transport;
pub mod worker;

pub use channel::{mailbox, ChannelError, Handler, Inbox, Outbox};
pub use coordinator::{Coordinator, CoordinatorHandle, PeerEvent, SessionState};
pub use peer::{Flow, InputBudget, PeerError, PeerLink, SendError};
pub use registry::SessionRegistry;
pub use scratch::ScratchStore;
pub use transport::{serve, submit_content, TransportSettings};
