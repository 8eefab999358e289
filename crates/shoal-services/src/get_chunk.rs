//! Chunk request handshake.
//!
//! Sends `GetChunk` and waits for the matching `GetChunkResult`. On success
//! the connection leaves the session with the announced chunk size, ready for
//! the raw stream. Whatever happens, a connection the session still holds is
//! returned to its pool exactly once, when the session is dropped.

use std::time::Duration;

use shoal_core::protocol::PeerMessageType;
use shoal_core::{ChunkStatus, GetChunk, GetChunkResult, PeerMessage, WireMessage};

use crate::connection::{ConnectionError, PeerConnection};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer refused the chunk: {0:?}")]
    Status(ChunkStatus),
    #[error("peer accepted the request without announcing the chunk size")]
    MissingChunkSize,
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("session no longer holds a connection")]
    Detached,
}

/// An accepted request: the connection now carries
/// `chunk_size - offset` raw bytes.
pub struct ChunkStream {
    pub connection: PeerConnection,
    pub chunk_size: u64,
}

pub struct GetChunkSession {
    request: GetChunk,
    conn: Option<PeerConnection>,
    timeout: Duration,
    error: bool,
    sent: bool,
    answered: bool,
}

impl GetChunkSession {
    pub fn new(conn: PeerConnection, request: GetChunk, timeout: Duration) -> Self {
        Self {
            request,
            conn: Some(conn),
            timeout,
            error: false,
            sent: false,
            answered: false,
        }
    }

    pub fn request(&self) -> &GetChunk {
        &self.request
    }

    /// Send the request and wait for its result.
    pub async fn start(&mut self) -> Result<ChunkStream, HandshakeError> {
        let result = match tokio::time::timeout(self.timeout, self.exchange()).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.error = true;
                return Err(e);
            }
            Err(_) => {
                self.error = true;
                return Err(HandshakeError::Timeout(self.timeout));
            }
        };
        self.answered = true;

        if result.status != ChunkStatus::Ok {
            self.error = true;
            return Err(HandshakeError::Status(result.status));
        }
        let Some(chunk_size) = result.chunk_size else {
            self.error = true;
            return Err(HandshakeError::MissingChunkSize);
        };
        let connection = self.conn.take().ok_or(HandshakeError::Detached)?;
        Ok(ChunkStream {
            connection,
            chunk_size,
        })
    }

    async fn exchange(&mut self) -> Result<GetChunkResult, HandshakeError> {
        let conn = self.conn.as_mut().ok_or(HandshakeError::Detached)?;
        conn.send(&PeerMessage::GetChunk(self.request.clone())).await?;
        self.sent = true;

        loop {
            let frame = conn.recv_frame().await?;
            if frame.header.msg_type() != PeerMessageType::GetChunkResult as u32 {
                tracing::trace!(msg_type = frame.header.msg_type(), "ignoring message during chunk request");
                continue;
            }
            match PeerMessage::from_frame(&frame).map_err(ConnectionError::from)? {
                PeerMessage::GetChunkResult(result) => return Ok(result),
                PeerMessage::GetChunk(_) => continue,
            }
        }
    }
}

impl Drop for GetChunkSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.finished(self.error || (self.sent && !self.answered));
        }
    }
}
