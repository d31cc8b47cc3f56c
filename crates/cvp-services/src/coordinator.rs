//! Session coordinator: the single event loop behind every peer session.
//!
//! Peer events arrive through `CoordinatorHandle`; worker reports arrive
//! through the coordinator's own mailbox. Both are handled on one task, so
//! session state needs no locking. Each session owns one worker thread
//! that stages the payload; the coordinator never touches storage.
//!
//! Per-session flow:
//!   Start → worker ready → request → chunks → end of stream
//!     → ReadyToProcess → verdict → chunks back under clear-to-send → EOF
//!
//! Teardown is two-phase. Ending a session drops its state here, sends the
//! worker `End`, and records the id in the registry. Every report from that
//! worker is then discarded until its `WorkerExited` clears the entry.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use cvp_core::command::Direction;
use cvp_core::{Command, Message, Payload, RequestParams, SessionId, VerdictPolicy};

use crate::channel::{mailbox, ChannelError, Handler, Inbox, Outbox};
use crate::peer::{Flow, InputBudget, PeerError, PeerLink, SendError};
use crate::registry::SessionRegistry;
use crate::scratch::ScratchStore;
use crate::worker;

/// How long shutdown waits for workers to confirm their exit.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Something the peer side did to a session.
pub enum PeerEvent {
    Start {
        session: SessionId,
        link: Box<dyn PeerLink>,
    },
    Request {
        session: SessionId,
        params: RequestParams,
    },
    Chunk {
        session: SessionId,
        data: Bytes,
    },
    EndOfStream {
        session: SessionId,
    },
    ClearToSend {
        session: SessionId,
        flow: Flow,
    },
    End {
        session: SessionId,
    },
}

impl PeerEvent {
    pub fn session(&self) -> SessionId {
        match self {
            PeerEvent::Start { session, .. }
            | PeerEvent::Request { session, .. }
            | PeerEvent::Chunk { session, .. }
            | PeerEvent::EndOfStream { session }
            | PeerEvent::ClearToSend { session, .. }
            | PeerEvent::End { session } => *session,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerEvent::Start { .. } => "start",
            PeerEvent::Request { .. } => "request",
            PeerEvent::Chunk { .. } => "chunk",
            PeerEvent::EndOfStream { .. } => "end-of-stream",
            PeerEvent::ClearToSend { .. } => "clear-to-send",
            PeerEvent::End { .. } => "end",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Worker spawned, peer input held back until it reports ready.
    AwaitingWorkerReady,
    /// Taking the request and the uploaded payload.
    ReceivingRequest,
    /// Upload complete, waiting for the worker to finish staging.
    AwaitingVerdict,
    /// Verdict sent, payload flowing back to the peer.
    Streaming,
    /// End of content delivered; waiting for the peer to close.
    Finished,
}

#[derive(Debug, thiserror::Error)]
enum SessionFault {
    #[error("worker unreachable: {0}")]
    Worker(#[from] ChannelError),
    #[error("peer link failed: {0}")]
    Peer(#[from] PeerError),
    #[error("worker failed: {0}")]
    Storage(String),
    #[error("worker exited unexpectedly")]
    WorkerGone,
}

struct Session {
    state: SessionState,
    request: RequestParams,
    chunk_size: usize,
    received: u64,
    streamed: u64,
    streaming: bool,
    /// A `SendChunkRequest` is outstanding.
    waiting_for_chunk: bool,
    /// Chunk the peer refused, retried on the next clear-to-send.
    pending: Option<Payload>,
    worker: Outbox,
    link: Box<dyn PeerLink>,
}

impl Session {
    fn tell_worker(&self, session: SessionId, command: Command) -> Result<(), ChannelError> {
        debug_assert_ne!(command.direction(), Direction::ToCoordinator, "{}", command.name());
        self.worker.send(Message::new(session, command))
    }
}

pub struct Coordinator {
    chunk_size: usize,
    store: ScratchStore,
    policy: Arc<dyn VerdictPolicy>,
    sessions: HashMap<SessionId, Session>,
    registry: SessionRegistry,
    reports: Outbox,
}

impl Coordinator {
    /// Build a coordinator. The returned inbox carries worker reports and
    /// must be fed back through `dispatch` (or `run`).
    pub fn new(
        chunk_size: usize,
        store: ScratchStore,
        policy: Arc<dyn VerdictPolicy>,
    ) -> (Self, Inbox) {
        let (reports, inbox) = mailbox();
        let coordinator = Self {
            chunk_size: chunk_size.max(1),
            store,
            policy,
            sessions: HashMap::new(),
            registry: SessionRegistry::new(),
            reports,
        };
        (coordinator, inbox)
    }

    pub fn session_state(&self, session: SessionId) -> Option<SessionState> {
        self.sessions.get(&session).map(|s| s.state)
    }

    pub fn is_ending(&self, session: SessionId) -> bool {
        self.registry.is_ending(session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Run until shutdown or until every peer event sender is gone, then
    /// end the remaining sessions and wait a bounded time for their workers.
    pub async fn run(
        mut self,
        mut reports: Inbox,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("coordinator shutting down");
                    break;
                }

                event = events.recv() => match event {
                    Some(event) => self.handle_peer(event),
                    None => {
                        tracing::info!("peer event senders dropped, coordinator exiting");
                        break;
                    }
                },

                flow = reports.deliver(&mut self) => {
                    if flow.is_break() {
                        break;
                    }
                }
            }
        }

        self.drain(&mut reports).await;
        Ok(())
    }

    async fn drain(&mut self, reports: &mut Inbox) {
        let live: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session in live {
            self.abort(session);
        }
        if !self.registry.is_empty() {
            tracing::info!(workers = self.registry.len(), "waiting for workers to exit");
        }

        let drained = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            while !self.registry.is_empty() {
                match reports.recv().await {
                    Some(message) => self.dispatch(message),
                    None => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            for session in self.registry.pending() {
                tracing::warn!(%session, "worker did not confirm exit before shutdown");
            }
        }
    }

    // ── Peer side ─────────────────────────────────────────────────────────────

    pub fn handle_peer(&mut self, event: PeerEvent) {
        let session = event.session();
        tracing::trace!(%session, event = event.name(), "peer event");

        let result = match event {
            PeerEvent::Start { session, link } => {
                self.on_session_start(session, link);
                Ok(())
            }
            PeerEvent::Request { session, params } => self.on_request(session, params),
            PeerEvent::Chunk { session, data } => self.on_peer_chunk(session, data),
            PeerEvent::EndOfStream { session } => self.on_peer_end_of_stream(session),
            PeerEvent::ClearToSend { session, flow } => self.on_clear_to_send(session, flow),
            PeerEvent::End { session } => {
                self.on_session_end(session);
                Ok(())
            }
        };

        if let Err(fault) = result {
            tracing::warn!(%session, error = %fault, "aborting session");
            self.abort(session);
        }
    }

    fn on_session_start(&mut self, session: SessionId, mut link: Box<dyn PeerLink>) {
        if self.sessions.contains_key(&session) || self.registry.is_ending(session) {
            tracing::warn!(%session, "session id already in use, refusing");
            link.close();
            return;
        }

        let worker = match worker::spawn(session, self.store.clone(), self.reports.clone()) {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!(%session, error = %e, "failed to spawn worker");
                link.close();
                return;
            }
        };

        link.suspend_input();
        self.sessions.insert(
            session,
            Session {
                state: SessionState::AwaitingWorkerReady,
                request: RequestParams::default(),
                chunk_size: self.chunk_size,
                received: 0,
                streamed: 0,
                streaming: false,
                waiting_for_chunk: false,
                pending: None,
                worker,
                link,
            },
        );
        tracing::info!(%session, "session started");
    }

    fn on_request(&mut self, session: SessionId, params: RequestParams) -> Result<(), SessionFault> {
        let Some(s) = self.sessions.get_mut(&session) else {
            tracing::debug!(%session, "request for unknown session ignored");
            return Ok(());
        };

        tracing::info!(
            %session,
            filename = params.filename(),
            content_type = %params.content_type,
            protocol = %params.protocol,
            command = params.command(),
            action = %params.action,
            "request parameters"
        );

        s.chunk_size = self.chunk_size.min(s.link.max_chunk_size()).max(1);
        s.request = params;
        s.link.request_more_input(InputBudget::Unlimited)?;
        s.tell_worker(
            session,
            Command::Begin {
                chunk_size: s.chunk_size,
            },
        )?;
        Ok(())
    }

    fn on_peer_chunk(&mut self, session: SessionId, data: Bytes) -> Result<(), SessionFault> {
        let Some(s) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        s.received += data.len() as u64;
        tracing::trace!(%session, len = data.len(), total = s.received, "chunk from peer");
        s.tell_worker(session, Command::ReceiveChunk(Payload::Data(data)))?;
        Ok(())
    }

    fn on_peer_end_of_stream(&mut self, session: SessionId) -> Result<(), SessionFault> {
        let Some(s) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        tracing::debug!(%session, bytes = s.received, "peer finished uploading");
        s.tell_worker(session, Command::ReceiveChunk(Payload::Eof))?;
        s.state = SessionState::AwaitingVerdict;
        Ok(())
    }

    fn on_clear_to_send(&mut self, session: SessionId, flow: Flow) -> Result<(), SessionFault> {
        if flow != Flow::Destination {
            return Ok(());
        }
        self.pump(session)
    }

    fn on_session_end(&mut self, session: SessionId) {
        let Some(s) = self.sessions.remove(&session) else {
            tracing::debug!(%session, "end for unknown session ignored");
            return;
        };

        tracing::info!(
            %session,
            state = ?s.state,
            received = s.received,
            streamed = s.streamed,
            "session ended"
        );

        match s.tell_worker(session, Command::End) {
            Ok(()) => self.registry.mark_ending(session),
            Err(e) => tracing::debug!(%session, error = %e, "worker already gone"),
        }
    }

    /// Locally initiated end: close the peer link, then tear down.
    fn abort(&mut self, session: SessionId) {
        if let Some(s) = self.sessions.get_mut(&session) {
            s.link.close();
        }
        self.on_session_end(session);
    }

    /// Move the stream forward: retry a refused chunk, otherwise ask the
    /// worker for the next one unless a request is already out.
    fn pump(&mut self, session: SessionId) -> Result<(), SessionFault> {
        let Some(s) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        if !s.streaming {
            return Ok(());
        }

        if let Some(payload) = s.pending.take() {
            tracing::debug!(%session, len = payload.len(), "retrying chunk");
            return forward(session, s, payload);
        }

        if !s.waiting_for_chunk {
            s.tell_worker(session, Command::SendChunkRequest)?;
            s.waiting_for_chunk = true;
        }
        Ok(())
    }

    // ── Worker side ───────────────────────────────────────────────────────────

    /// Route one worker report. Reports for sessions being torn down are
    /// dropped here, payload included, except the final `WorkerExited`.
    pub fn dispatch(&mut self, message: Message) {
        let Message { session, command } = message;

        if command == Command::WorkerExited {
            self.on_worker_exited(session);
            return;
        }
        if self.registry.is_ending(session) {
            tracing::debug!(%session, command = command.name(), "discarding report for ending session");
            return;
        }
        if !self.sessions.contains_key(&session) {
            tracing::warn!(%session, command = command.name(), "report for unknown session");
            return;
        }

        let result = match command {
            Command::WorkerReady => self.on_worker_ready(session),
            Command::ReadyToProcess => self.on_worker_ready_to_process(session),
            Command::ReceiveChunk(payload) => self.on_worker_chunk(session, payload),
            Command::WorkerError(reason) => Err(SessionFault::Storage(reason)),
            other => {
                tracing::warn!(%session, command = other.name(), "unexpected command from worker");
                Ok(())
            }
        };

        if let Err(fault) = result {
            tracing::warn!(%session, error = %fault, "aborting session");
            self.abort(session);
        }
    }

    fn on_worker_ready(&mut self, session: SessionId) -> Result<(), SessionFault> {
        if let Some(s) = self.sessions.get_mut(&session) {
            s.state = SessionState::ReceivingRequest;
            s.link.resume_input();
        }
        Ok(())
    }

    fn on_worker_ready_to_process(&mut self, session: SessionId) -> Result<(), SessionFault> {
        let Some(s) = self.sessions.get_mut(&session) else {
            return Ok(());
        };

        let verdict = self.policy.judge(&s.request);
        tracing::info!(
            %session,
            filename = s.request.filename(),
            opinion = ?verdict.opinion,
            flags = %format!("{:#04x}", verdict.flags()),
            "{}",
            verdict.explanation
        );

        s.link.send_verdict(&verdict)?;
        s.tell_worker(session, Command::StartSending)?;
        s.streaming = true;
        s.state = SessionState::Streaming;
        self.pump(session)
    }

    fn on_worker_chunk(&mut self, session: SessionId, payload: Payload) -> Result<(), SessionFault> {
        let Some(s) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        s.waiting_for_chunk = false;
        forward(session, s, payload)
    }

    fn on_worker_exited(&mut self, session: SessionId) {
        if self.registry.clear(session) {
            tracing::debug!(%session, "worker exit confirmed");
            return;
        }
        if self.sessions.contains_key(&session) {
            tracing::warn!(%session, error = %SessionFault::WorkerGone, "aborting session");
            self.abort(session);
        }
    }
}

impl Handler for Coordinator {
    fn handle(&mut self, message: Message) -> ControlFlow<()> {
        self.dispatch(message);
        ControlFlow::Continue(())
    }
}

/// Offer one chunk to the peer. Refused chunks are kept for retry and the
/// worker is not told; accepted ones are acknowledged.
fn forward(session: SessionId, s: &mut Session, payload: Payload) -> Result<(), SessionFault> {
    match s.link.send_chunk(&payload) {
        Ok(()) => {
            s.streamed += payload.len() as u64;
            s.tell_worker(session, Command::SendSuccessAck)?;
            if payload.is_eof() {
                s.streaming = false;
                s.state = SessionState::Finished;
                tracing::info!(%session, bytes = s.streamed, "content returned to peer");
            }
            Ok(())
        }
        Err(SendError::Backpressure) => {
            tracing::debug!(%session, len = payload.len(), "peer busy, holding chunk");
            s.pending = Some(payload);
            Ok(())
        }
        Err(SendError::Closed) => {
            tracing::debug!(%session, "peer link closed, holding chunk until session end");
            s.pending = Some(payload);
            Ok(())
        }
    }
}

/// Cloneable entry point for transports: submits peer events and hands out
/// session ids.
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::UnboundedSender<PeerEvent>,
    next_id: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let handle = Self {
            events,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (handle, rx)
    }

    /// Ids are never reused for the life of the process.
    pub fn allocate_session(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn submit(&self, event: PeerEvent) -> Result<(), PeerError> {
        self.events.send(event).map_err(|_| PeerError::Closed)
    }
}
