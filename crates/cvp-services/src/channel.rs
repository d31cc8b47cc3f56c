//! Mailboxes between the coordinator and workers.
//!
//! A mailbox is an unbounded FIFO queue: `Outbox::send` never blocks, and
//! each delivery hands exactly one message to the receiving side's
//! `Handler`. There is no priority and no way to recall a queued message;
//! stale messages are filtered by the session registry, not here.

use std::ops::ControlFlow;

use tokio::sync::mpsc;

use cvp_core::{Message, SessionId};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("mailbox closed, cannot deliver {command} for session {session}")]
    Closed {
        session: SessionId,
        command: &'static str,
    },
}

/// One handler per task. Returning `Break` deregisters it, which ends
/// the delivery loop driving it.
pub trait Handler {
    fn handle(&mut self, message: Message) -> ControlFlow<()>;
}

/// Sending half of a mailbox.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Message>,
}

/// Receiving half of a mailbox.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Message>,
}

pub fn mailbox() -> (Outbox, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbox { tx }, Inbox { rx })
}

impl Outbox {
    /// Queue a message. Fails only once the receiving side is gone.
    pub fn send(&self, message: Message) -> Result<(), ChannelError> {
        let session = message.session;
        let command = message.command.name();
        tracing::debug!(%session, command, "raising command");
        self.tx
            .send(message)
            .map_err(|_| ChannelError::Closed { session, command })
    }
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Wait for one message and hand it to `handler`.
    /// Breaks once every `Outbox` is dropped.
    pub async fn deliver<H: Handler>(&mut self, handler: &mut H) -> ControlFlow<()> {
        match self.rx.recv().await {
            Some(message) => Self::dispatch(handler, message),
            None => ControlFlow::Break(()),
        }
    }

    /// Blocking variant of `deliver` for dedicated worker threads.
    /// Must not be called from inside an async runtime.
    pub fn blocking_deliver<H: Handler>(&mut self, handler: &mut H) -> ControlFlow<()> {
        match self.rx.blocking_recv() {
            Some(message) => Self::dispatch(handler, message),
            None => ControlFlow::Break(()),
        }
    }

    fn dispatch<H: Handler>(handler: &mut H, message: Message) -> ControlFlow<()> {
        tracing::trace!(
            session = %message.session,
            command = message.command.name(),
            "delivering command"
        );
        handler.handle(message)
    }
}
