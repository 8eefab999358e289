//! Shoal integration test harness.
//!
//! Every test runs real TCP transfers over loopback: a downloader built from
//! `shoal-services` against either a real `Uploader` or a scripted fake peer.
//!
//!   cargo test --test integration
//!
//! Each test owns its listeners, stores and temp directories.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use shoal_core::config::TransferSettings;
use shoal_core::{ChunkHash, ChunkStatus, GetChunk, GetChunkResult, PeerId, PeerMessage};
use shoal_services::{
    ChunkDownload, ChunkStore, ConnectionPool, DownloadContext, DownloadEvent, OccupiedPeers,
    PeerConnection, PeerRegistry, Uploader,
};

mod handshake;
mod resume;
mod switching;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity the downloading side uses in every test.
pub const OUR_ID: PeerId = [0x0d; 32];

/// A fresh directory under the system temp dir.
pub fn temp_dir(label: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("shoal-it-{label}-{}-{}", std::process::id(), id));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Short timeouts so failure paths finish quickly.
pub fn test_settings() -> TransferSettings {
    TransferSettings {
        buffer_size: 16 * 1024,
        socket_timeout: 500,
        timeout_during_transfer: 400,
        ..TransferSettings::default()
    }
}

/// Deterministic pseudo-random content.
pub fn test_data(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Serve `store` on a loopback port until the returned sender fires.
pub async fn start_uploader(store: ChunkStore, id: PeerId) -> Result<(SocketAddr, broadcast::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind uploader")?;
    let addr = listener.local_addr()?;
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(Uploader::new(store, id, 3).serve(listener, rx));
    Ok((addr, tx))
}

/// A single-chunk downloader wired to its own registry and event queue.
pub struct Downloader {
    pub registry: PeerRegistry,
    pub occupied: OccupiedPeers,
    pub pool: ConnectionPool,
    pub events: mpsc::UnboundedReceiver<DownloadEvent>,
    pub download: Arc<ChunkDownload>,
}

impl Downloader {
    pub fn new(hash: ChunkHash, settings: TransferSettings) -> Self {
        let registry = PeerRegistry::new(settings.lan_speed);
        let occupied = OccupiedPeers::new();
        let pool = ConnectionPool::new(OUR_ID, settings.socket_timeout());
        let (tx, events) = mpsc::unbounded_channel();
        let ctx = Arc::new(DownloadContext {
            directory: Arc::new(registry.clone()),
            occupied: occupied.clone(),
            pool: pool.clone(),
            settings,
            events: tx,
        });
        Self {
            registry,
            occupied,
            pool,
            events,
            download: ChunkDownload::new(hash, ctx),
        }
    }

    /// Next `Finished` event, skipping `Started`.
    pub async fn finished(&mut self, within: Duration) -> DownloadEvent {
        loop {
            let event = tokio::time::timeout(within, self.events.recv())
                .await
                .expect("no event in time")
                .expect("event queue closed");
            if matches!(event, DownloadEvent::Finished { .. }) {
                return event;
            }
        }
    }
}

// ── Fake peer ─────────────────────────────────────────────────────────────────

/// How a fake peer answers chunk requests.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Read the request, never answer.
    Silent,
    Refuse(ChunkStatus),
    /// `Ok` with no chunk size.
    OkWithoutSize,
    /// First request: announce the chunk, send `after` bytes, then go quiet
    /// without closing. Later requests are served in full.
    StallOnce { after: usize },
    /// Send `piece` bytes every `every` until done.
    Trickle { piece: usize, every: Duration },
}

pub struct FakePeer {
    pub addr: SocketAddr,
    /// Requests received so far, in order.
    pub requests: mpsc::UnboundedReceiver<GetChunk>,
    served: Arc<AtomicUsize>,
}

impl FakePeer {
    pub fn requests_served(&self) -> usize {
        self.served.load(Ordering::Relaxed)
    }
}

pub async fn fake_peer(id: PeerId, data: Arc<Vec<u8>>, behavior: Behavior) -> Result<FakePeer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, requests) = mpsc::unbounded_channel();
    let served = Arc::new(AtomicUsize::new(0));

    let counter = served.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let data = data.clone();
            let tx = tx.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut conn = PeerConnection::accepted(stream, id);
                while let Ok(PeerMessage::GetChunk(request)) = conn.recv::<PeerMessage>().await {
                    let first = counter.fetch_add(1, Ordering::Relaxed) == 0;
                    let _ = tx.send(request.clone());
                    if answer(&mut conn, &data, &request, behavior, first).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    Ok(FakePeer {
        addr,
        requests,
        served,
    })
}

async fn answer(
    conn: &mut PeerConnection,
    data: &[u8],
    request: &GetChunk,
    behavior: Behavior,
    first: bool,
) -> Result<()> {
    let offset = request.offset as usize;
    match behavior {
        Behavior::Silent => hold(conn).await,
        Behavior::Refuse(status) => {
            conn.send(&PeerMessage::GetChunkResult(GetChunkResult::refused(status)))
                .await?;
            Ok(())
        }
        Behavior::OkWithoutSize => {
            conn.send(&PeerMessage::GetChunkResult(GetChunkResult::refused(ChunkStatus::Ok)))
                .await?;
            Ok(())
        }
        Behavior::StallOnce { after } if first => {
            conn.send(&PeerMessage::GetChunkResult(GetChunkResult::ok(data.len() as u64)))
                .await?;
            conn.write_raw(&data[offset..offset + after]).await?;
            hold(conn).await
        }
        Behavior::StallOnce { .. } => {
            conn.send(&PeerMessage::GetChunkResult(GetChunkResult::ok(data.len() as u64)))
                .await?;
            conn.write_raw(&data[offset..]).await?;
            Ok(())
        }
        Behavior::Trickle { piece, every } => {
            conn.send(&PeerMessage::GetChunkResult(GetChunkResult::ok(data.len() as u64)))
                .await?;
            for part in data[offset..].chunks(piece) {
                conn.write_raw(part).await?;
                tokio::time::sleep(every).await;
            }
            Ok(())
        }
    }
}

/// Keep the connection open until the other side drops it.
async fn hold(conn: &mut PeerConnection) -> Result<()> {
    while conn.recv_frame().await.is_ok() {}
    anyhow::bail!("connection dropped by downloader")
}
