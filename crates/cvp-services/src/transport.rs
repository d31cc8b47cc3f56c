//! TCP peer transport.
//!
//! Each accepted connection becomes one session. A reader task turns frames
//! into `PeerEvent`s, gated so the coordinator decides when input may flow.
//! A writer task drains a bounded outbound queue and raises clear-to-send
//! after every frame it puts on the wire. A full queue is what the
//! coordinator sees as backpressure.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};

use cvp_core::wire::{Frame, FrameHeader, WireError, HEADER_LEN};
use cvp_core::{Payload, SessionId, Verdict};

use crate::coordinator::{CoordinatorHandle, PeerEvent};
use crate::peer::{Flow, InputBudget, PeerError, PeerLink, SendError};

#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    /// Largest DATA frame accepted from, or sent to, a peer.
    pub max_chunk_size: usize,
    /// Frames queued per connection before sends report backpressure.
    pub outbound_depth: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: 64 * 1024,
            outbound_depth: 8,
        }
    }
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly
/// between frames; a close partway through a header is `Truncated`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut raw[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => return Err(WireError::Truncated),
            n => filled += n,
        }
    }
    let header = FrameHeader::parse(&raw)?;

    let mut body = BytesMut::zeroed(header.payload_len());
    reader.read_exact(&mut body).await?;
    Frame::decode(&header, body.freeze()).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

// ── Input gate ────────────────────────────────────────────────────────────────

/// Whether the reader may pull the next frame off the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InputGate {
    suspended: bool,
    budget: InputBudget,
    closed: bool,
}

impl InputGate {
    fn initial() -> Self {
        Self {
            suspended: true,
            budget: InputBudget::Unlimited,
            closed: false,
        }
    }

    fn is_open(&self) -> bool {
        !self.suspended && !self.closed && self.budget != InputBudget::Bytes(0)
    }
}

// ── Link ──────────────────────────────────────────────────────────────────────

struct TcpLink {
    session: SessionId,
    outbound: mpsc::Sender<Frame>,
    gate: Arc<watch::Sender<InputGate>>,
    max_chunk_size: usize,
}

impl PeerLink for TcpLink {
    fn send_chunk(&mut self, payload: &Payload) -> Result<(), SendError> {
        let frame = match payload {
            Payload::Data(bytes) => Frame::Data(bytes.clone()),
            Payload::Eof => Frame::Eof,
        };
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn send_verdict(&mut self, verdict: &Verdict) -> Result<(), PeerError> {
        self.outbound
            .try_send(Frame::Verdict(verdict.clone()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    PeerError::Rejected("outbound queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => PeerError::Closed,
            })
    }

    fn request_more_input(&mut self, budget: InputBudget) -> Result<(), PeerError> {
        if self.gate.is_closed() || self.gate.borrow().closed {
            return Err(PeerError::Closed);
        }
        self.gate.send_modify(|g| g.budget = budget);
        Ok(())
    }

    fn suspend_input(&mut self) {
        self.gate.send_modify(|g| g.suspended = true);
    }

    fn resume_input(&mut self) {
        self.gate.send_modify(|g| g.suspended = false);
    }

    fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    fn close(&mut self) {
        tracing::debug!(session = %self.session, "closing peer connection");
        self.gate.send_modify(|g| g.closed = true);
    }
}

// ── Connection tasks ──────────────────────────────────────────────────────────

/// Register a new connection with the coordinator and start its tasks.
pub fn open_connection(
    stream: TcpStream,
    handle: &CoordinatorHandle,
    settings: TransportSettings,
) -> Result<SessionId, PeerError> {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let session = handle.allocate_session();
    let (reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_depth.max(1));
    let (gate_tx, writer_gate) = watch::channel(InputGate::initial());
    let gate = Arc::new(gate_tx);

    let link = TcpLink {
        session,
        outbound: outbound_tx,
        gate: gate.clone(),
        max_chunk_size: settings.max_chunk_size,
    };
    handle.submit(PeerEvent::Start {
        session,
        link: Box::new(link),
    })?;

    tokio::spawn(read_loop(
        session,
        reader,
        handle.clone(),
        gate,
        settings.max_chunk_size,
    ));
    tokio::spawn(write_loop(
        session,
        writer,
        outbound_rx,
        handle.clone(),
        writer_gate,
    ));
    Ok(session)
}

async fn read_loop(
    session: SessionId,
    mut reader: OwnedReadHalf,
    handle: CoordinatorHandle,
    gate: Arc<watch::Sender<InputGate>>,
    max_chunk_size: usize,
) {
    match read_frames(session, &mut reader, &handle, &gate, max_chunk_size).await {
        Ok(()) => tracing::debug!(%session, "peer input finished"),
        Err(e) => {
            tracing::warn!(%session, error = %e, "peer connection failed");
            gate.send_modify(|g| g.closed = true);
        }
    }
    let _ = handle.submit(PeerEvent::End { session });
}

async fn read_frames(
    session: SessionId,
    reader: &mut OwnedReadHalf,
    handle: &CoordinatorHandle,
    gate: &watch::Sender<InputGate>,
    max_chunk_size: usize,
) -> Result<(), WireError> {
    let mut rx = gate.subscribe();
    loop {
        let current = match rx.wait_for(|g| g.closed || g.is_open()).await {
            Ok(current) => *current,
            Err(_) => return Ok(()),
        };
        if current.closed {
            return Ok(());
        }

        let frame = tokio::select! {
            frame = read_frame(reader) => frame?,
            _ = rx.wait_for(|g| g.closed) => return Ok(()),
        };

        let event = match frame {
            None => return Ok(()),
            Some(Frame::Request(params)) => PeerEvent::Request { session, params },
            Some(Frame::Data(data)) => {
                if data.len() > max_chunk_size {
                    return Err(WireError::Oversize(data.len()));
                }
                consume_budget(gate, data.len());
                PeerEvent::Chunk { session, data }
            }
            Some(Frame::Eof) => PeerEvent::EndOfStream { session },
            Some(other) => return Err(WireError::UnknownTag(other.tag())),
        };

        if handle.submit(event).is_err() {
            return Ok(());
        }
    }
}

fn consume_budget(gate: &watch::Sender<InputGate>, len: usize) {
    gate.send_modify(|g| {
        if let InputBudget::Bytes(left) = &mut g.budget {
            *left = left.saturating_sub(len as u64);
        }
    });
}

async fn write_loop(
    session: SessionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
    handle: CoordinatorHandle,
    mut gate: watch::Receiver<InputGate>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = gate.wait_for(|g| g.closed) => break,
        };

        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::warn!(%session, error = %e, "failed to write to peer");
            break;
        }
        if frame == Frame::Eof {
            tracing::debug!(%session, "content fully written");
            break;
        }
        let ready = PeerEvent::ClearToSend {
            session,
            flow: Flow::Destination,
        };
        if handle.submit(ready).is_err() {
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(%session, error = %e, "socket shutdown failed");
    }
}

/// Accept peers until shutdown, one session per connection.
pub async fn serve(
    listener: TcpListener,
    handle: CoordinatorHandle,
    settings: TransportSettings,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let local: SocketAddr = listener.local_addr().context("listener has no local address")?;
    tracing::info!(addr = %local, "accepting peers");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let session = open_connection(stream, &handle, settings)
                        .context("coordinator is no longer accepting sessions")?;
                    tracing::info!(%session, peer = %addr, "peer connected");
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }
    }
}

/// Client side of one inspection: send the request and content, then
/// collect the verdict and the returned content.
pub async fn submit_content<S>(
    stream: &mut S,
    request: cvp_core::RequestParams,
    content: Bytes,
    chunk_size: usize,
) -> Result<(Verdict, Vec<u8>), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &Frame::Request(request)).await?;
    for chunk in content.chunks(chunk_size.max(1)) {
        write_frame(stream, &Frame::Data(content.slice_ref(chunk))).await?;
    }
    write_frame(stream, &Frame::Eof).await?;

    let mut verdict = None;
    let mut returned = Vec::with_capacity(content.len());
    loop {
        match read_frame(stream).await? {
            Some(Frame::Verdict(v)) => verdict = Some(v),
            Some(Frame::Data(data)) => returned.extend_from_slice(&data),
            Some(Frame::Eof) => break,
            Some(other) => return Err(WireError::UnknownTag(other.tag())),
            None => return Err(WireError::Truncated),
        }
    }
    let verdict = verdict.ok_or(WireError::Truncated)?;
    Ok((verdict, returned))
}
