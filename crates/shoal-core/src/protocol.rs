//! Peer protocol catalog: chunk requests between two cores.
//!
//! A downloader sends `GetChunk`; the uploader answers with exactly one
//! `GetChunkResult`. When the status is `Ok` the same connection then carries
//! `chunk_size - offset` raw bytes with no further framing.

use serde::{Deserialize, Serialize};

use crate::wire::{decode_json, encode_json, ChunkHash, WireError, WireMessage};

/// Type identifiers of the peer catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PeerMessageType {
    GetChunk = 0x51,
    GetChunkResult = 0x52,
}

impl TryFrom<u32> for PeerMessageType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x51 => Ok(PeerMessageType::GetChunk),
            0x52 => Ok(PeerMessageType::GetChunkResult),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// Request for the bytes of a chunk, starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChunk {
    pub chunk: ChunkHash,
    /// Bytes of the chunk the requester already holds.
    pub offset: u64,
}

/// Status of a chunk request. Only `Ok` lets the raw stream follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Ok,
    AlreadyDownloading,
    TooManyConnections,
    DontHave,
    Error,
}

/// Reply to [`GetChunk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChunkResult {
    pub status: ChunkStatus,
    /// Total size of the chunk. Required when `status` is `Ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

impl GetChunkResult {
    pub fn ok(chunk_size: u64) -> Self {
        Self {
            status: ChunkStatus::Ok,
            chunk_size: Some(chunk_size),
        }
    }

    pub fn refused(status: ChunkStatus) -> Self {
        Self {
            status,
            chunk_size: None,
        }
    }
}

/// Every message of the peer catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    GetChunk(GetChunk),
    GetChunkResult(GetChunkResult),
}

impl WireMessage for PeerMessage {
    fn msg_type(&self) -> u32 {
        match self {
            PeerMessage::GetChunk(_) => PeerMessageType::GetChunk as u32,
            PeerMessage::GetChunkResult(_) => PeerMessageType::GetChunkResult as u32,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        match self {
            PeerMessage::GetChunk(m) => encode_json(m),
            PeerMessage::GetChunkResult(m) => encode_json(m),
        }
    }

    fn decode(msg_type: u32, payload: &[u8]) -> Result<Self, WireError> {
        match PeerMessageType::try_from(msg_type)? {
            PeerMessageType::GetChunk => Ok(PeerMessage::GetChunk(decode_json(msg_type, payload)?)),
            PeerMessageType::GetChunkResult => {
                Ok(PeerMessage::GetChunkResult(decode_json(msg_type, payload)?))
            }
        }
    }
}
