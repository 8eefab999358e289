//! File download scheduler: drives the chunk downloads of one file.
//!
//! Owns the occupancy registry shared by those chunk downloads and the
//! receiving end of their event queue. Idle chunk downloads are re-examined
//! whenever a peer is freed, an attempt ends, and once a second.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal_core::config::TransferSettings;
use shoal_core::{ChunkHash, PeerId};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use crate::chunk::Chunk;
use crate::chunk_download::{ChunkDownload, DownloadContext, DownloadEvent};
use crate::connection::ConnectionPool;
use crate::occupied::OccupiedPeers;
use crate::peer::PeerDirectory;

const RETRY_PERIOD: Duration = Duration::from_secs(1);

/// What a finished (or interrupted) file download achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub chunks: usize,
    pub completed: usize,
    /// Bytes received over every attempt.
    pub bytes: u64,
    pub attempts: u64,
    pub failed_attempts: u64,
    pub interrupted: bool,
}

impl DownloadSummary {
    pub fn is_complete(&self) -> bool {
        self.completed == self.chunks
    }
}

enum Wake {
    Event(DownloadEvent),
    Retry,
    Shutdown,
}

pub struct FileDownload {
    ctx: Arc<DownloadContext>,
    events: mpsc::UnboundedReceiver<DownloadEvent>,
    chunks: Vec<Arc<ChunkDownload>>,
    shutdown: broadcast::Receiver<()>,
}

impl FileDownload {
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        pool: ConnectionPool,
        settings: TransferSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let ctx = Arc::new(DownloadContext {
            directory,
            occupied: OccupiedPeers::new(),
            pool,
            settings,
            events: events_tx,
        });
        Self {
            ctx,
            events,
            chunks: Vec::new(),
            shutdown,
        }
    }

    pub fn occupied(&self) -> &OccupiedPeers {
        &self.ctx.occupied
    }

    pub fn chunks(&self) -> &[Arc<ChunkDownload>] {
        &self.chunks
    }

    /// Schedule a chunk, fetchable from `peers`.
    pub fn add_chunk(&mut self, hash: ChunkHash, chunk: Arc<dyn Chunk>, peers: &[PeerId]) -> Arc<ChunkDownload> {
        let download = ChunkDownload::new(hash, self.ctx.clone());
        download.bind_chunk(chunk);
        for peer in peers {
            download.add_peer(*peer);
        }
        self.chunks.push(download.clone());
        download
    }

    /// Download until every chunk is complete, no incomplete chunk has a
    /// peer left, or shutdown.
    ///
    /// A chunk download whose attempt failed waits one retry period before
    /// its next attempt.
    pub async fn run(mut self) -> DownloadSummary {
        let mut summary = DownloadSummary {
            chunks: self.chunks.len(),
            ..DownloadSummary::default()
        };
        let mut failed_at: HashMap<ChunkHash, Instant> = HashMap::new();
        let mut retry = tokio::time::interval(RETRY_PERIOD);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.chunks.iter().all(|c| c.is_complete()) {
                break;
            }
            let stalled = self
                .chunks
                .iter()
                .filter(|c| !c.is_complete())
                .all(|c| !c.has_at_least_a_peer() && !c.is_downloading());
            if stalled {
                tracing::warn!("no peer left for the remaining chunks");
                break;
            }

            self.start_ready(&failed_at);

            let wake = tokio::select! {
                Some(event) = self.events.recv() => Wake::Event(event),
                _ = self.ctx.occupied.peer_freed() => Wake::Retry,
                _ = retry.tick() => Wake::Retry,
                _ = self.shutdown.recv() => Wake::Shutdown,
            };
            match wake {
                Wake::Event(event) => record(&mut summary, &mut failed_at, event),
                Wake::Retry => {}
                Wake::Shutdown => {
                    tracing::info!("file download shutting down");
                    summary.interrupted = true;
                    self.abort_all().await;
                    break;
                }
            }
        }

        self.drain(&mut summary, &mut failed_at).await;
        summary.completed = self.chunks.iter().filter(|c| c.is_complete()).count();
        tracing::info!(
            chunks = summary.chunks,
            completed = summary.completed,
            bytes = summary.bytes,
            attempts = summary.attempts,
            failed = summary.failed_attempts,
            "file download finished"
        );
        summary
    }

    fn start_ready(&self, failed_at: &HashMap<ChunkHash, Instant>) {
        for download in &self.chunks {
            let cooling = failed_at
                .get(&download.hash())
                .is_some_and(|at| at.elapsed() < RETRY_PERIOD);
            if !cooling && download.is_ready_to_download() {
                download.start_downloading();
            }
        }
    }

    /// Record the events of attempts still ending. A chunk reads complete as
    /// soon as its last byte is written, before its attempt reports.
    async fn drain(&mut self, summary: &mut DownloadSummary, failed_at: &mut HashMap<ChunkHash, Instant>) {
        let timeout = self.ctx.settings.socket_timeout();
        loop {
            while let Ok(event) = self.events.try_recv() {
                record(summary, failed_at, event);
            }
            if !self.chunks.iter().any(|c| c.is_downloading()) {
                break;
            }
            match tokio::time::timeout(timeout, self.events.recv()).await {
                Ok(Some(event)) => record(summary, failed_at, event),
                _ => break,
            }
        }
        while let Ok(event) = self.events.try_recv() {
            record(summary, failed_at, event);
        }
    }

    /// Abort every chunk download and give in-flight attempts a moment to end.
    async fn abort_all(&mut self) {
        for download in &self.chunks {
            download.abort();
        }
        let deadline = tokio::time::Instant::now() + self.ctx.settings.socket_timeout();
        while self.chunks.iter().any(|c| c.is_downloading()) {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("chunk downloads still running after abort");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn record(summary: &mut DownloadSummary, failed_at: &mut HashMap<ChunkHash, Instant>, event: DownloadEvent) {
    match event {
        DownloadEvent::Started { chunk, peer } => {
            summary.attempts += 1;
            tracing::trace!(
                chunk = hex::encode(&chunk[..8]),
                peer = hex::encode(&peer[..8]),
                "attempt started"
            );
        }
        DownloadEvent::Finished {
            chunk, bytes, outcome, ..
        } => {
            summary.bytes += bytes;
            if outcome.is_error() {
                summary.failed_attempts += 1;
                failed_at.insert(chunk, Instant::now());
            } else {
                failed_at.remove(&chunk);
            }
        }
    }
}
