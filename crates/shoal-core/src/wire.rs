//! Shoal wire format: the framing under every Shoal connection.
//!
//! Every message, on the peer protocol and on the local control protocol
//! alike, is a fixed 40-byte [`MessageHeader`] followed by exactly
//! `header.size` bytes of payload. The two protocols differ only in their
//! catalog of message types (see `protocol` and `control`).
//!
//! The header is a zerocopy struct with network-endian integer fields, so its
//! layout is identical on every platform. There is no unsafe code in this
//! module.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Stable identity of a peer (or of the local core, on the control protocol).
pub type PeerId = [u8; 32];

/// BLAKE3 hash identifying a chunk.
pub type ChunkHash = [u8; 32];

// ── Message Header ────────────────────────────────────────────────────────────

/// Precedes every payload on every Shoal connection.
///
/// Wire size: 40 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct MessageHeader {
    /// Message type identifier, interpreted by the protocol catalog in use.
    pub msg_type: U32<NetworkEndian>,

    /// Length of the payload in bytes, not including this header.
    pub size: U32<NetworkEndian>,

    /// Identity of the sender.
    pub sender_id: PeerId,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(MessageHeader, [u8; 40]);

impl MessageHeader {
    pub fn new(msg_type: u32, size: u32, sender_id: PeerId) -> Self {
        Self {
            msg_type: U32::new(msg_type),
            size: U32::new(size),
            sender_id,
        }
    }

    pub fn msg_type(&self) -> u32 {
        self.msg_type.get()
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Header size in bytes.
pub const HEADER_SIZE: usize = 40;

/// Largest payload a receiver will buffer for a single message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

// ── Typed messages ────────────────────────────────────────────────────────────

/// A message catalog layered on the framing.
///
/// Payloads are JSON. The type identifier travels in the header, never in
/// the payload.
pub trait WireMessage: Sized {
    /// Type identifier written in the header.
    fn msg_type(&self) -> u32;

    /// Serialize the payload (without header).
    fn encode_payload(&self) -> Result<Vec<u8>, WireError>;

    /// Decode a payload received under the given type identifier.
    fn decode(msg_type: u32, payload: &[u8]) -> Result<Self, WireError>;

    /// Header + payload, ready to be written to a connection.
    fn to_frame(&self, sender: &PeerId) -> Result<Vec<u8>, WireError> {
        let payload = self.encode_payload()?;
        encode_frame(self.msg_type(), sender, &payload)
    }

    /// Decode a complete frame.
    fn from_frame(frame: &Frame) -> Result<Self, WireError> {
        Self::decode(frame.header.msg_type(), &frame.payload)
    }
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(value).map_err(|e| WireError::Serialize(e.to_string()))
}

pub(crate) fn decode_json<T: DeserializeOwned>(msg_type: u32, payload: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(payload).map_err(|e| WireError::Malformed {
        msg_type,
        reason: e.to_string(),
    })
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Write a header and payload into one buffer.
pub fn encode_frame(msg_type: u32, sender: &PeerId, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let header = MessageHeader::new(msg_type, payload.len() as u32, *sender);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// A complete message: header and its full payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Bytes,
}

/// Incremental frame decoder.
///
/// Bytes are appended as they arrive. A header is parsed only once all 40
/// bytes are buffered, and a payload is handed out only once `header.size`
/// bytes follow it. Partial input stays buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    current: Option<MessageHeader>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from bytes already read off a connection.
    pub fn with_buffered(buf: BytesMut) -> Self {
        Self { buf, current: None }
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access for `read_buf`-style reads.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes buffered and not yet handed out (excluding a parsed header).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        let header = match self.current {
            Some(header) => header,
            None => {
                if self.buf.len() < HEADER_SIZE {
                    return Ok(None);
                }
                // Checked before consuming, so a rejected header stays buffered.
                let header =
                    MessageHeader::read_from(&self.buf[..HEADER_SIZE]).ok_or(WireError::Truncated)?;
                if header.size() as usize > MAX_MESSAGE_SIZE {
                    return Err(WireError::PayloadTooLarge(header.size() as usize));
                }
                let _ = self.buf.split_to(HEADER_SIZE);
                self.current = Some(header);
                header
            }
        };

        let size = header.size() as usize;
        if self.buf.len() < size {
            return Ok(None);
        }

        self.current = None;
        let payload = self.buf.split_to(size).freeze();
        Ok(Some(Frame { header, payload }))
    }

    /// Give back every byte not yet handed out, including a parsed but
    /// unconsumed header.
    pub fn into_buffered(mut self) -> BytesMut {
        match self.current.take() {
            Some(header) => {
                let mut out = BytesMut::with_capacity(HEADER_SIZE + self.buf.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(&self.buf);
                out
            }
            None => self.buf,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("payload length {0} exceeds maximum {}", MAX_MESSAGE_SIZE)]
    PayloadTooLarge(usize),

    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u32),

    #[error("malformed payload for message type 0x{msg_type:02x}: {reason}")]
    Malformed { msg_type: u32, reason: String },

    #[error("failed to serialize payload: {0}")]
    Serialize(String),

    #[error("truncated header")]
    Truncated,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
