//! Peer wire format: framing for the TCP peer adapter.
//!
//! Every frame is an 8-byte header followed by `length` payload bytes.
//! Content travels raw in `DATA` frames; requests and verdicts are JSON.
//! The scratch copy of a payload has no framing at all; this format only
//! exists between the daemon and its peers.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::verdict::{RequestParams, Verdict};

/// Frame header. Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// One of the `tag` constants.
    pub tag: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 2],
    /// Payload length, big-endian.
    pub length: [u8; 4],
}

assert_eq_size!(FrameHeader, [u8; 8]);

pub const HEADER_LEN: usize = 8;

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 1 << 20;

pub mod tag {
    /// Peer → server: JSON `RequestParams`. First frame of a session.
    pub const REQUEST: u8 = 0x01;
    /// Either direction: raw content bytes.
    pub const DATA: u8 = 0x02;
    /// Either direction: end of content.
    pub const EOF: u8 = 0x03;
    /// Server → peer: JSON `Verdict`, before any returned content.
    pub const VERDICT: u8 = 0x04;
}

impl FrameHeader {
    pub fn new(tag: u8, length: usize) -> Self {
        Self {
            tag,
            flags: 0,
            reserved: [0; 2],
            length: (length as u32).to_be_bytes(),
        }
    }

    /// Parse and validate a header read off the socket.
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self, WireError> {
        let header = Self::read_from(&raw[..]).ok_or(WireError::Truncated)?;
        let length = header.payload_len();
        if length > MAX_FRAME_PAYLOAD {
            return Err(WireError::Oversize(length));
        }
        Ok(header)
    }

    pub fn payload_len(&self) -> usize {
        u32::from_be_bytes(self.length) as usize
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated frame header")]
    Truncated,
    #[error("frame payload of {0} bytes exceeds limit")]
    Oversize(usize),
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("malformed frame body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(RequestParams),
    Data(Bytes),
    Eof,
    Verdict(Verdict),
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Request(_) => tag::REQUEST,
            Frame::Data(_) => tag::DATA,
            Frame::Eof => tag::EOF,
            Frame::Verdict(_) => tag::VERDICT,
        }
    }

    /// Header plus payload, ready to write.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body: Vec<u8> = match self {
            Frame::Request(params) => serde_json::to_vec(params)?,
            Frame::Verdict(verdict) => serde_json::to_vec(verdict)?,
            Frame::Data(bytes) => bytes.to_vec(),
            Frame::Eof => Vec::new(),
        };
        if body.len() > MAX_FRAME_PAYLOAD {
            return Err(WireError::Oversize(body.len()));
        }

        let header = FrameHeader::new(self.tag(), body.len());
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(header: &FrameHeader, body: Bytes) -> Result<Self, WireError> {
        match header.tag {
            tag::REQUEST => Ok(Frame::Request(serde_json::from_slice(&body)?)),
            tag::DATA => Ok(Frame::Data(body)),
            tag::EOF => Ok(Frame::Eof),
            tag::VERDICT => Ok(Frame::Verdict(serde_json::from_slice(&body)?)),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}
