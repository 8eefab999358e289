//! Uploader: serves chunks of the local store to peers.
//!
//! Each accepted connection carries any number of successive `GetChunk`
//! requests. Every request gets exactly one `GetChunkResult`; an `Ok` result
//! is followed by the chunk's raw bytes from the requested offset.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use shoal_core::{ChunkStatus, GetChunk, GetChunkResult, PeerId, PeerMessage, WireError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};

use crate::connection::{ConnectionError, PeerConnection};
use crate::store::ChunkStore;

pub struct Uploader {
    store: ChunkStore,
    our_id: PeerId,
    slots: Arc<Semaphore>,
    max_uploads: usize,
}

impl Uploader {
    pub fn new(store: ChunkStore, our_id: PeerId, max_uploads: u32) -> Arc<Self> {
        let max_uploads = max_uploads.max(1) as usize;
        Arc::new(Self {
            store,
            our_id,
            slots: Arc::new(Semaphore::new(max_uploads)),
            max_uploads,
        })
    }

    /// Uploads currently streaming.
    pub fn active_uploads(&self) -> usize {
        self.max_uploads - self.slots.available_permits()
    }

    /// Accept peer connections until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let local = listener.local_addr().context("uploader listener has no address")?;
        tracing::info!(addr = %local, max_uploads = self.max_uploads, "uploader listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("uploader shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, addr).await {
                            tracing::debug!(%addr, error = %e, "peer connection ended");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ConnectionError> {
        stream.set_nodelay(true)?;
        let mut conn = PeerConnection::accepted(stream, self.our_id);
        tracing::trace!(%addr, "peer connected");

        loop {
            let msg = match conn.recv::<PeerMessage>().await {
                Ok(msg) => msg,
                Err(ConnectionError::Closed) => return Ok(()),
                Err(ConnectionError::Wire(WireError::UnknownMessageType(t))) => {
                    tracing::debug!(%addr, msg_type = t, "ignoring unknown message");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match msg {
                PeerMessage::GetChunk(request) => self.serve_chunk(&mut conn, request, addr).await?,
                PeerMessage::GetChunkResult(_) => {
                    tracing::debug!(%addr, "unexpected chunk result from peer");
                }
            }
        }
    }

    async fn serve_chunk(&self, conn: &mut PeerConnection, request: GetChunk, addr: SocketAddr) -> Result<(), ConnectionError> {
        let chunk = hex::encode(&request.chunk[..8]);

        let store = self.store.clone();
        let hash = request.chunk;
        let data = match tokio::task::spawn_blocking(move || store.read(&hash)).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::debug!(%addr, chunk, "chunk not stored");
                return refuse(conn, ChunkStatus::DontHave).await;
            }
            Ok(Err(e)) => {
                tracing::warn!(%addr, chunk, error = %e, "unable to read chunk");
                return refuse(conn, ChunkStatus::Error).await;
            }
            Err(e) => {
                tracing::warn!(%addr, chunk, error = %e, "chunk read task failed");
                return refuse(conn, ChunkStatus::Error).await;
            }
        };

        let Ok(_permit) = self.slots.clone().try_acquire_owned() else {
            tracing::debug!(%addr, chunk, "no upload slot free");
            return refuse(conn, ChunkStatus::TooManyConnections).await;
        };

        let size = data.len() as u64;
        if request.offset > size {
            tracing::debug!(%addr, chunk, offset = request.offset, size, "offset beyond chunk end");
            return refuse(conn, ChunkStatus::Error).await;
        }

        conn.send(&PeerMessage::GetChunkResult(GetChunkResult::ok(size)))
            .await?;
        conn.write_raw(&data[request.offset as usize..]).await?;
        tracing::info!(%addr, chunk, offset = request.offset, size, "chunk uploaded");
        Ok(())
    }
}

async fn refuse(conn: &mut PeerConnection, status: ChunkStatus) -> Result<(), ConnectionError> {
    conn.send(&PeerMessage::GetChunkResult(GetChunkResult::refused(status)))
        .await
}
