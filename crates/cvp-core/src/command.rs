//! Command vocabulary spoken between the session coordinator and a worker.
//!
//! Every exchange across the thread boundary is a `Message`: a target
//! session plus one `Command`. Payload bytes are moved into the message by
//! the sender and belong to the receiver from then on; the two threads
//! never touch the same buffer.

use std::fmt;

use bytes::Bytes;

/// Opaque session identifier. Workers hold it only as an addressing token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// One chunk of a payload stream, or the end-of-stream marker.
///
/// A single enum means a message can never carry both bytes and the
/// sentinel at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(Bytes),
    Eof,
}

impl Payload {
    pub fn is_eof(&self) -> bool {
        matches!(self, Payload::Eof)
    }

    /// Byte length of the chunk. The end-of-stream marker has none.
    pub fn len(&self) -> usize {
        match self {
            Payload::Data(bytes) => bytes.len(),
            Payload::Eof => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> Option<&Bytes> {
        match self {
            Payload::Data(bytes) => Some(bytes),
            Payload::Eof => None,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Data(bytes)
    }
}

/// Which side raises a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToWorker,
    ToCoordinator,
    Both,
}

/// The closed set of commands exchanged over a session's mailboxes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open fresh scratch storage; chunks of at most `chunk_size` bytes
    /// will be requested back later.
    Begin { chunk_size: usize },
    /// Release storage and exit.
    End,
    /// A payload chunk. Coordinator → worker while the peer uploads,
    /// worker → coordinator while streaming content back.
    ReceiveChunk(Payload),
    /// Read the next chunk from storage and hand it over.
    SendChunkRequest,
    /// Reopen storage for reading from the start.
    StartSending,
    /// Storage holds the complete payload; a verdict can be formed.
    ReadyToProcess,
    /// The last chunk handed over reached the peer.
    SendSuccessAck,
    /// The worker's mailbox is live.
    WorkerReady,
    /// A storage operation failed; the session cannot continue.
    WorkerError(String),
    /// Last message a worker ever sends.
    WorkerExited,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Begin { .. } => "Begin",
            Command::End => "End",
            Command::ReceiveChunk(_) => "ReceiveChunk",
            Command::SendChunkRequest => "SendChunkRequest",
            Command::StartSending => "StartSending",
            Command::ReadyToProcess => "ReadyToProcess",
            Command::SendSuccessAck => "SendSuccessAck",
            Command::WorkerReady => "WorkerReady",
            Command::WorkerError(_) => "WorkerError",
            Command::WorkerExited => "WorkerExited",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Command::Begin { .. }
            | Command::End
            | Command::SendChunkRequest
            | Command::StartSending
            | Command::SendSuccessAck => Direction::ToWorker,
            Command::ReadyToProcess
            | Command::WorkerReady
            | Command::WorkerError(_)
            | Command::WorkerExited => Direction::ToCoordinator,
            Command::ReceiveChunk(_) => Direction::Both,
        }
    }
}

/// A command addressed to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub session: SessionId,
    pub command: Command,
}

impl Message {
    pub fn new(session: SessionId, command: Command) -> Self {
        Self { session, command }
    }
}
