//! Peer connections and the pool that owns them.
//!
//! A [`PeerConnection`] is lent to one chunk request at a time and comes back
//! through [`PeerConnection::finished`]. Clean connections are kept idle for
//! the next request to the same peer; errored ones are closed.
//!
//! For the raw streaming phase a connection is detached into a blocking
//! [`DetachedConnection`] that can be moved to a worker thread, then
//! reattached on the async side before it is released.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use shoal_core::wire::{Frame, FrameDecoder};
use shoal_core::{PeerId, WireError, WireMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::peer::Peer;

/// Idle connections kept per peer.
const MAX_IDLE_PER_PEER: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("connection closed by peer")]
    Closed,
    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),
}

struct IdleConnection {
    stream: TcpStream,
    decoder: FrameDecoder,
}

struct PoolInner {
    our_id: PeerId,
    connect_timeout: Duration,
    idle: DashMap<PeerId, Vec<IdleConnection>>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(our_id: PeerId, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                our_id,
                connect_timeout,
                idle: DashMap::new(),
            }),
        }
    }

    pub fn our_id(&self) -> PeerId {
        self.inner.our_id
    }

    /// A connection to `peer`: an idle one if available, else a new one.
    pub async fn get(&self, peer: &Peer) -> Result<PeerConnection, ConnectionError> {
        let reused = self
            .inner
            .idle
            .get_mut(&peer.id())
            .and_then(|mut idle| idle.pop());
        if let Some(IdleConnection { stream, decoder }) = reused {
            tracing::trace!(peer = hex::encode(&peer.id()[..8]), "reusing idle connection");
            return Ok(self.wrap(peer.id(), stream, decoder));
        }

        let addr = peer.addr();
        let stream = tokio::time::timeout(self.inner.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(addr))??;
        stream.set_nodelay(true)?;
        tracing::debug!(peer = hex::encode(&peer.id()[..8]), %addr, "connected to peer");
        Ok(self.wrap(peer.id(), stream, FrameDecoder::new()))
    }

    /// Take a connection back. Errored connections are closed.
    pub fn release(&self, conn: PeerConnection, error: bool) {
        let peer = conn.peer_id;
        if error {
            tracing::trace!(peer = hex::encode(&peer[..8]), "closing errored connection");
            return;
        }
        let mut idle = self.inner.idle.entry(peer).or_default();
        if idle.len() < MAX_IDLE_PER_PEER {
            idle.push(IdleConnection {
                stream: conn.stream,
                decoder: conn.decoder,
            });
        }
    }

    /// Idle connections currently kept for `peer`.
    pub fn idle_count(&self, peer: &PeerId) -> usize {
        self.inner.idle.get(peer).map(|idle| idle.len()).unwrap_or(0)
    }

    fn wrap(&self, peer_id: PeerId, stream: TcpStream, decoder: FrameDecoder) -> PeerConnection {
        PeerConnection {
            peer_id,
            our_id: self.inner.our_id,
            stream,
            decoder,
            pool: Some(self.clone()),
        }
    }
}

// ── PeerConnection ────────────────────────────────────────────────────────────

/// A framed connection to a peer.
pub struct PeerConnection {
    peer_id: PeerId,
    our_id: PeerId,
    stream: TcpStream,
    decoder: FrameDecoder,
    pool: Option<ConnectionPool>,
}

impl PeerConnection {
    /// Wrap an accepted stream. Such a connection has no pool to return to.
    pub fn accepted(stream: TcpStream, our_id: PeerId) -> Self {
        Self {
            peer_id: [0; 32],
            our_id,
            stream,
            decoder: FrameDecoder::new(),
            pool: None,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub async fn send<M: WireMessage>(&mut self, msg: &M) -> Result<(), ConnectionError> {
        let frame = msg.to_frame(&self.our_id)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Next complete frame. `Closed` if the peer hangs up first.
    pub async fn recv_frame(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            let n = self.stream.read_buf(self.decoder.buffer_mut()).await?;
            if n == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }

    pub async fn recv<M: WireMessage>(&mut self) -> Result<M, ConnectionError> {
        let frame = self.recv_frame().await?;
        Ok(M::from_frame(&frame)?)
    }

    /// Raw bytes, bypassing the framing.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Convert into a blocking connection for a worker thread. Bytes already
    /// buffered past the last frame are kept.
    pub fn detach(self) -> Result<DetachedConnection, ConnectionError> {
        let stream = self.stream.into_std()?;
        stream.set_nonblocking(false)?;
        Ok(DetachedConnection {
            peer_id: self.peer_id,
            our_id: self.our_id,
            stream,
            pending: self.decoder.into_buffered(),
            pool: self.pool,
        })
    }

    /// Hand the connection back to its pool.
    pub fn finished(self, error: bool) {
        if let Some(pool) = self.pool.clone() {
            pool.release(self, error);
        }
    }
}

// ── DetachedConnection ────────────────────────────────────────────────────────

/// Blocking form of a [`PeerConnection`], owned by exactly one thread.
pub struct DetachedConnection {
    peer_id: PeerId,
    our_id: PeerId,
    stream: std::net::TcpStream,
    pending: BytesMut,
    pool: Option<ConnectionPool>,
}

impl DetachedConnection {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))
    }

    /// A second handle on the socket. Shutting it down unblocks a pending read.
    pub fn abort_handle(&self) -> io::Result<AbortHandle> {
        Ok(AbortHandle(self.stream.try_clone()?))
    }

    /// Blocking read. Returns 0 at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Ok(n);
        }
        self.stream.read(buf)
    }

    /// Back to the async side. Must run inside the runtime.
    pub fn reattach(self) -> Result<PeerConnection, ConnectionError> {
        self.stream.set_read_timeout(None)?;
        self.stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(self.stream)?;
        Ok(PeerConnection {
            peer_id: self.peer_id,
            our_id: self.our_id,
            stream,
            decoder: FrameDecoder::with_buffered(self.pending),
            pool: self.pool,
        })
    }
}

/// Cancels an in-flight blocking read from another thread.
#[derive(Debug)]
pub struct AbortHandle(std::net::TcpStream);

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}
