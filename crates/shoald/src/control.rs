//! Local control listener.
//!
//! Clients connect on the loopback core port and speak the control catalog.
//! The core pushes a `State` snapshot every second. Client requests are
//! logged; this core has no browse or chat support to act on them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use shoal_core::control::{ControlMessage, PeerState, State};
use shoal_core::{PeerId, WireMessage};
use shoal_services::{ChunkStore, ConnectionError, PeerConnection, PeerRegistry, Uploader};

const STATE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ControlListener {
    our_id: PeerId,
    registry: PeerRegistry,
    store: ChunkStore,
    uploader: Arc<Uploader>,
}

impl ControlListener {
    pub fn new(our_id: PeerId, registry: PeerRegistry, store: ChunkStore, uploader: Arc<Uploader>) -> Self {
        Self {
            our_id,
            registry,
            store,
            uploader,
        }
    }

    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let local = listener.local_addr().context("control listener has no address")?;
        tracing::info!(addr = %local, "control listener ready");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("control listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "control accept failed");
                            continue;
                        }
                    };
                    let this = self.clone();
                    let shutdown = shutdown.resubscribe();
                    tokio::spawn(async move {
                        match this.serve_client(stream, addr, shutdown).await {
                            Ok(()) | Err(ConnectionError::Closed) => {
                                tracing::info!(%addr, "control client disconnected");
                            }
                            Err(e) => tracing::warn!(%addr, error = %e, "control client failed"),
                        }
                    });
                }
            }
        }
    }

    async fn serve_client(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        tracing::info!(%addr, "control client connected");
        let mut conn = PeerConnection::accepted(stream, self.our_id);
        let mut ticker = tokio::time::interval(STATE_PERIOD);

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = ticker.tick() => {
                    conn.send(&ControlMessage::State(self.snapshot())).await?;
                }
                frame = conn.recv_frame() => {
                    let frame = frame?;
                    match ControlMessage::from_frame(&frame) {
                        Ok(msg) if msg.is_from_core() => {
                            tracing::debug!(%addr, kind = ?msg.kind(), "client sent a core message");
                        }
                        Ok(msg) => {
                            tracing::info!(%addr, kind = ?msg.kind(), "ignoring client request");
                        }
                        Err(e) => tracing::debug!(%addr, error = %e, "undecodable control message"),
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> State {
        let peers = self
            .registry
            .all()
            .iter()
            .map(|peer| PeerState {
                peer_id: peer.id(),
                addr: peer.addr().to_string(),
                speed: peer.speed(),
            })
            .collect();
        State {
            peers,
            stored_chunks: self.store.count() as u64,
            stored_bytes: self.store.size(),
            active_uploads: self.uploader.active_uploads() as u32,
        }
    }
}
