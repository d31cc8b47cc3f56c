//! Per-session worker: stages the peer's payload in scratch storage and
//! streams it back on request.
//!
//! Each worker runs on its own OS thread and blocks only while waiting for
//! the next command. All file I/O happens here so the coordinator loop never
//! touches the disk.
//!
//! Lifecycle:
//!   Idle → Receiving → ReadyToProcess → Sending → Idle
//!
//! `WorkerReady` is the first report, `WorkerExited` the last. Between
//! them every failure is reported as `WorkerError` and the worker stays
//! alive until told to end.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::mem;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::thread;

use bytes::Bytes;

use cvp_core::command::Direction;
use cvp_core::{Command, Message, Payload, SessionId};

use crate::channel::{mailbox, ChannelError, Handler, Inbox, Outbox};
use crate::scratch::ScratchStore;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to create scratch file {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("failed to append to scratch file: {0}")]
    Write(io::Error),
    #[error("failed to close scratch file: {0}")]
    Close(io::Error),
    #[error("failed to open scratch file {path} for reading: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to read scratch file: {0}")]
    Read(io::Error),
    #[error("unexpected {command} while {state}")]
    UnexpectedCommand {
        command: &'static str,
        state: &'static str,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

enum WorkerState {
    Idle,
    Receiving {
        file: BufWriter<File>,
        hasher: blake3::Hasher,
        bytes: u64,
    },
    ReadyToProcess,
    Sending {
        file: File,
        /// Last chunk handed over and not yet acknowledged.
        unacked: Option<Payload>,
        eof: bool,
    },
}

impl WorkerState {
    fn name(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Receiving { .. } => "receiving",
            WorkerState::ReadyToProcess => "ready to process",
            WorkerState::Sending { .. } => "sending",
        }
    }
}

struct Worker {
    session: SessionId,
    store: ScratchStore,
    reports: Outbox,
    chunk_size: usize,
    path: Option<PathBuf>,
    state: WorkerState,
}

/// Start a worker thread for `session`. Reports go to `reports`; the
/// returned outbox feeds the worker.
pub fn spawn(session: SessionId, store: ScratchStore, reports: Outbox) -> io::Result<Outbox> {
    let (outbox, inbox) = mailbox();
    let worker = Worker {
        session,
        store,
        reports,
        chunk_size: cvp_core::config::DEFAULT_CHUNK_SIZE,
        path: None,
        state: WorkerState::Idle,
    };
    thread::Builder::new()
        .name(format!("cvp-worker-{session}"))
        .spawn(move || run(worker, inbox))?;
    Ok(outbox)
}

fn run(mut worker: Worker, mut inbox: Inbox) {
    let session = worker.session;
    let _span = tracing::debug_span!("worker", %session).entered();

    if worker.report(Command::WorkerReady).is_ok() {
        while inbox.blocking_deliver(&mut worker).is_continue() {}
    }

    worker.release();
    if worker.report(Command::WorkerExited).is_err() {
        tracing::debug!("coordinator gone before worker exit was reported");
    }
}

impl Handler for Worker {
    fn handle(&mut self, message: Message) -> ControlFlow<()> {
        if message.session != self.session {
            tracing::warn!(
                session = %message.session,
                command = message.command.name(),
                "command addressed to another session"
            );
            return ControlFlow::Continue(());
        }

        if message.command == Command::End {
            self.release();
            return ControlFlow::Break(());
        }

        match self.apply(message.command) {
            Ok(()) => ControlFlow::Continue(()),
            Err(WorkerError::Channel(_)) => ControlFlow::Break(()),
            Err(e) => {
                tracing::warn!(error = %e, "worker operation failed");
                match self.report(Command::WorkerError(e.to_string())) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                }
            }
        }
    }
}

impl Worker {
    fn report(&self, command: Command) -> Result<(), ChannelError> {
        debug_assert_ne!(command.direction(), Direction::ToWorker, "{}", command.name());
        self.reports.send(Message::new(self.session, command))
    }

    fn unexpected(&self, command: &Command) -> WorkerError {
        WorkerError::UnexpectedCommand {
            command: command.name(),
            state: self.state.name(),
        }
    }

    fn apply(&mut self, command: Command) -> Result<(), WorkerError> {
        match command {
            Command::Begin { chunk_size } => self.begin(chunk_size),
            Command::ReceiveChunk(Payload::Data(bytes)) => self.append(bytes),
            Command::ReceiveChunk(Payload::Eof) => self.finish_receiving(),
            Command::StartSending => self.start_sending(),
            Command::SendChunkRequest => self.send_chunk(),
            Command::SendSuccessAck => self.acknowledge(),
            other => Err(self.unexpected(&other)),
        }
    }

    fn begin(&mut self, chunk_size: usize) -> Result<(), WorkerError> {
        self.release();

        let path = self.store.allocate(self.session);
        let file = File::create(&path).map_err(|source| WorkerError::Create {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), chunk_size, "scratch file created");

        self.chunk_size = chunk_size.max(1);
        self.path = Some(path);
        self.state = WorkerState::Receiving {
            file: BufWriter::new(file),
            hasher: blake3::Hasher::new(),
            bytes: 0,
        };
        Ok(())
    }

    fn append(&mut self, data: Bytes) -> Result<(), WorkerError> {
        match &mut self.state {
            WorkerState::Receiving {
                file,
                hasher,
                bytes,
            } => {
                file.write_all(&data).map_err(WorkerError::Write)?;
                hasher.update(&data);
                *bytes += data.len() as u64;
                tracing::trace!(len = data.len(), total = *bytes, "chunk staged");
                Ok(())
            }
            _ => Err(self.unexpected(&Command::ReceiveChunk(Payload::Data(data)))),
        }
    }

    fn finish_receiving(&mut self) -> Result<(), WorkerError> {
        match mem::replace(&mut self.state, WorkerState::ReadyToProcess) {
            WorkerState::Receiving {
                file,
                hasher,
                bytes,
            } => {
                let file = file.into_inner().map_err(|e| WorkerError::Close(e.into_error()))?;
                file.sync_data().map_err(WorkerError::Close)?;
                drop(file);

                let digest = hasher.finalize();
                tracing::info!(
                    bytes,
                    blake3 = %hex::encode(&digest.as_bytes()[..8]),
                    "payload staged"
                );
                self.report(Command::ReadyToProcess)?;
                Ok(())
            }
            previous => {
                self.state = previous;
                Err(self.unexpected(&Command::ReceiveChunk(Payload::Eof)))
            }
        }
    }

    fn start_sending(&mut self) -> Result<(), WorkerError> {
        let path = match (&self.state, &self.path) {
            (WorkerState::Receiving { .. }, _) | (_, None) => {
                return Err(self.unexpected(&Command::StartSending))
            }
            (_, Some(path)) => path.clone(),
        };
        let file = File::open(&path).map_err(|source| WorkerError::Open { path, source })?;
        self.state = WorkerState::Sending {
            file,
            unacked: None,
            eof: false,
        };
        Ok(())
    }

    fn send_chunk(&mut self) -> Result<(), WorkerError> {
        let chunk_size = self.chunk_size as u64;
        let payload = match &mut self.state {
            WorkerState::Sending {
                unacked: Some(payload),
                ..
            } => {
                tracing::debug!(len = payload.len(), "re-sending unacknowledged chunk");
                payload.clone()
            }
            WorkerState::Sending { file, unacked, eof } => {
                let payload = if *eof {
                    Payload::Eof
                } else {
                    let mut buf = Vec::with_capacity(chunk_size as usize);
                    Read::by_ref(file)
                        .take(chunk_size)
                        .read_to_end(&mut buf)
                        .map_err(WorkerError::Read)?;
                    if buf.is_empty() {
                        *eof = true;
                        Payload::Eof
                    } else {
                        Payload::Data(Bytes::from(buf))
                    }
                };
                *unacked = Some(payload.clone());
                payload
            }
            _ => return Err(self.unexpected(&Command::SendChunkRequest)),
        };
        self.report(Command::ReceiveChunk(payload))?;
        Ok(())
    }

    fn acknowledge(&mut self) -> Result<(), WorkerError> {
        match &mut self.state {
            WorkerState::Sending { unacked, eof, .. } => {
                unacked.take();
                if *eof {
                    tracing::debug!("payload streamed back");
                    self.state = WorkerState::Idle;
                }
                Ok(())
            }
            _ => Err(self.unexpected(&Command::SendSuccessAck)),
        }
    }

    /// Close any open handle and delete the scratch file. Idempotent.
    fn release(&mut self) {
        self.state = WorkerState::Idle;
        if let Some(path) = self.path.take() {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "scratch file removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch file")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scratch::tests::temp_store;
    use std::time::Duration;

    const ID: SessionId = SessionId::new(0x51);

    async fn next(reports: &mut Inbox) -> Command {
        let message = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .expect("worker report timed out")
            .expect("worker mailbox closed");
        assert_eq!(message.session, ID);
        message.command
    }

    fn send(worker: &Outbox, command: Command) {
        worker.send(Message::new(ID, command)).unwrap();
    }

    fn data(bytes: &'static [u8]) -> Command {
        Command::ReceiveChunk(Payload::Data(Bytes::from_static(bytes)))
    }

    async fn staged(
        store: &ScratchStore,
        chunk_size: usize,
        chunks: &[&'static [u8]],
    ) -> (Outbox, Inbox) {
        let (reports_tx, mut reports) = mailbox();
        let worker = spawn(ID, store.clone(), reports_tx).unwrap();
        assert_eq!(next(&mut reports).await, Command::WorkerReady);

        send(&worker, Command::Begin { chunk_size });
        for chunk in chunks {
            send(&worker, data(*chunk));
        }
        send(&worker, Command::ReceiveChunk(Payload::Eof));
        assert_eq!(next(&mut reports).await, Command::ReadyToProcess);
        (worker, reports)
    }

    #[tokio::test]
    async fn staged_payload_streams_back_in_order() {
        let store = temp_store();
        let (worker, mut reports) = staged(&store, 4, &[&b"abc"[..], b"def"]).await;
        assert_eq!(store.count(), 1);

        send(&worker, Command::StartSending);
        let mut returned = Vec::new();
        let mut sizes = Vec::new();
        loop {
            send(&worker, Command::SendChunkRequest);
            let payload = match next(&mut reports).await {
                Command::ReceiveChunk(p) => p,
                other => panic!("unexpected {}", other.name()),
            };
            send(&worker, Command::SendSuccessAck);
            match payload {
                Payload::Data(bytes) => {
                    sizes.push(bytes.len());
                    returned.extend_from_slice(&bytes);
                }
                Payload::Eof => break,
            }
        }
        assert_eq!(returned, b"abcdef");
        assert_eq!(sizes, [4, 2]);

        send(&worker, Command::End);
        assert_eq!(next(&mut reports).await, Command::WorkerExited);
        assert_eq!(store.count(), 0);
        let _ = fs::remove_dir_all(store.root());
    }

    #[tokio::test]
    async fn unacknowledged_chunk_is_resent_not_reread() {
        let store = temp_store();
        let (worker, mut reports) = staged(&store, 3, &[&b"xyzuvw"[..]]).await;
        send(&worker, Command::StartSending);

        send(&worker, Command::SendChunkRequest);
        let first = next(&mut reports).await;
        send(&worker, Command::SendChunkRequest);
        let again = next(&mut reports).await;
        assert_eq!(first, data(b"xyz"));
        assert_eq!(again, first);

        send(&worker, Command::SendSuccessAck);
        send(&worker, Command::SendChunkRequest);
        assert_eq!(next(&mut reports).await, data(b"uvw"));

        send(&worker, Command::End);
        assert_eq!(next(&mut reports).await, Command::WorkerExited);
        let _ = fs::remove_dir_all(store.root());
    }

    #[tokio::test]
    async fn begin_fails_when_scratch_root_is_gone() {
        let store = temp_store();
        fs::remove_dir_all(store.root()).unwrap();

        let (reports_tx, mut reports) = mailbox();
        let worker = spawn(ID, store.clone(), reports_tx).unwrap();
        assert_eq!(next(&mut reports).await, Command::WorkerReady);

        send(&worker, Command::Begin { chunk_size: 16 });
        match next(&mut reports).await {
            Command::WorkerError(reason) => assert!(reason.contains("failed to create")),
            other => panic!("unexpected {}", other.name()),
        }

        send(&worker, Command::End);
        assert_eq!(next(&mut reports).await, Command::WorkerExited);
    }

    #[tokio::test]
    async fn start_sending_fails_when_scratch_file_is_gone() {
        let store = temp_store();
        let (worker, mut reports) = staged(&store, 4, &[&b"vanishing"[..]]).await;
        assert_eq!(store.purge(), 1);

        send(&worker, Command::StartSending);
        match next(&mut reports).await {
            Command::WorkerError(reason) => assert!(reason.contains("for reading")),
            other => panic!("unexpected {}", other.name()),
        }

        // Nothing was opened, so there is nothing to stream.
        send(&worker, Command::SendChunkRequest);
        match next(&mut reports).await {
            Command::WorkerError(reason) => assert!(reason.starts_with("unexpected SendChunkRequest")),
            other => panic!("unexpected {}", other.name()),
        }

        send(&worker, Command::End);
        assert_eq!(next(&mut reports).await, Command::WorkerExited);
        let _ = fs::remove_dir_all(store.root());
    }

    #[tokio::test]
    async fn chunk_before_begin_is_a_protocol_error() {
        let store = temp_store();
        let (reports_tx, mut reports) = mailbox();
        let worker = spawn(ID, store.clone(), reports_tx).unwrap();
        assert_eq!(next(&mut reports).await, Command::WorkerReady);

        send(&worker, data(b"early"));
        match next(&mut reports).await {
            Command::WorkerError(reason) => {
                assert_eq!(reason, "unexpected ReceiveChunk while idle")
            }
            other => panic!("unexpected {}", other.name()),
        }

        send(&worker, Command::End);
        assert_eq!(next(&mut reports).await, Command::WorkerExited);
        let _ = fs::remove_dir_all(store.root());
    }

    #[tokio::test]
    async fn closed_inbox_still_cleans_up() {
        let store = temp_store();
        let (worker, mut reports) = staged(&store, 8, &[&b"left behind"[..]]).await;
        assert_eq!(store.count(), 1);

        drop(worker);
        assert_eq!(next(&mut reports).await, Command::WorkerExited);
        assert_eq!(store.count(), 0);
        let _ = fs::remove_dir_all(store.root());
    }
}
