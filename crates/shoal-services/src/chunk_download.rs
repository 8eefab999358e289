//! Download of a single chunk.
//!
//! A `ChunkDownload` knows a set of candidate peers. When asked whether it is
//! ready, it picks the fastest peer no other download of the same file is
//! using. Starting the download reserves that peer, requests the chunk from
//! the bytes already known (resume), and streams the answer into the chunk on
//! a dedicated thread.
//!
//! While streaming, the current peer's speed is measured about once a second.
//! When the current peer is slow and a free peer is much faster, the transfer
//! is abandoned so the scheduler can restart it from the faster peer.
//!
//! Lifecycle of an attempt:
//!
//! ```text
//! Idle → Ready → Handshaking → Streaming → Completed | Failed | Superseded
//! ```
//!
//! Failed and Superseded return to Idle with the peer freed. Every attempt
//! ends through `downloading_ended`, which posts one [`DownloadEvent::Finished`].

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use shoal_core::config::TransferSettings;
use shoal_core::{ChunkHash, GetChunk, PeerId};
use tokio::sync::{mpsc, oneshot, watch};

use crate::chunk::{Chunk, ChunkWriter};
use crate::connection::{AbortHandle, ConnectionPool, DetachedConnection, PeerConnection};
use crate::get_chunk::{ChunkStream, GetChunkSession, HandshakeError};
use crate::occupied::OccupiedPeers;
use crate::peer::{Peer, PeerDirectory};
use crate::rate::RateEstimator;

/// Interval between two measurements of the current peer's speed.
const SPEED_RECHECK_PERIOD: Duration = Duration::from_secs(1);

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Every byte of the chunk is written.
    Completed,
    /// Abandoned for a faster peer.
    Superseded,
    NetworkError,
    HandshakeFailed,
    StorageError,
    ProtocolError,
    Cancelled,
}

impl AttemptOutcome {
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            AttemptOutcome::Completed | AttemptOutcome::Superseded | AttemptOutcome::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Started {
        chunk: ChunkHash,
        peer: PeerId,
    },
    Finished {
        chunk: ChunkHash,
        peer: Option<PeerId>,
        /// Bytes received during the attempt.
        bytes: u64,
        outcome: AttemptOutcome,
    },
}

/// Collaborators shared by every chunk download of a file.
pub struct DownloadContext {
    pub directory: Arc<dyn PeerDirectory>,
    pub occupied: OccupiedPeers,
    pub pool: ConnectionPool,
    pub settings: TransferSettings,
    pub events: mpsc::UnboundedSender<DownloadEvent>,
}

// ── Switch rule ───────────────────────────────────────────────────────────────

/// Whether to leave a peer streaming at `current` bytes/s for the fastest
/// free candidate, if any.
pub fn should_switch(current: u64, candidate: Option<u64>, settings: &TransferSettings) -> bool {
    let Some(candidate) = candidate else {
        return false;
    };
    let factor = u64::from(settings.switch_to_another_peer_factor);
    current < settings.switch_threshold() && candidate > current.saturating_mul(factor)
}

// ── ChunkDownload ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    peers: Vec<PeerId>,
    chunk: Option<Arc<dyn Chunk>>,
    /// Peer chosen by the last successful readiness check.
    selected: Option<PeerId>,
    current_peer: Option<PeerId>,
    downloading: bool,
    announced_size: Option<u64>,
    /// Incremented on every start, so a late end never closes a newer attempt.
    attempt: u64,
}

struct AttemptReport {
    outcome: AttemptOutcome,
    bytes: u64,
    /// Present only when the stream was fully consumed.
    connection: Option<PeerConnection>,
}

impl AttemptReport {
    fn ended(outcome: AttemptOutcome, bytes: u64) -> Self {
        Self {
            outcome,
            bytes,
            connection: None,
        }
    }
}

pub struct ChunkDownload {
    hash: ChunkHash,
    ctx: Arc<DownloadContext>,
    state: Mutex<State>,
    rate: Mutex<RateEstimator>,
    cancel: watch::Sender<bool>,
    abort: Mutex<Option<AbortHandle>>,
    received: AtomicU64,
}

impl ChunkDownload {
    pub fn new(hash: ChunkHash, ctx: Arc<DownloadContext>) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            hash,
            ctx,
            state: Mutex::new(State::default()),
            rate: Mutex::new(RateEstimator::new()),
            cancel,
            abort: Mutex::new(None),
            received: AtomicU64::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rate(&self) -> MutexGuard<'_, RateEstimator> {
        self.rate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_slot(&self) -> MutexGuard<'_, Option<AbortHandle>> {
        self.abort.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn short_hash(&self) -> String {
        hex::encode(&self.hash[..8])
    }

    // ── Peers ─────────────────────────────────────────────────────────────────

    /// Add a candidate peer. A peer unknown to the occupancy registry is
    /// registered as free.
    pub fn add_peer(&self, peer: PeerId) {
        {
            let mut state = self.state();
            if !state.peers.contains(&peer) {
                state.peers.push(peer);
            }
        }
        self.ctx.occupied.new_peer(peer);
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        let mut state = self.state();
        state.peers.retain(|p| p != peer);
        if state.selected.as_ref() == Some(peer) {
            state.selected = None;
        }
    }

    /// Add a peer learned out of band, optionally announcing it to the
    /// occupancy registry.
    pub fn set_peer_as_source(&self, peer: PeerId, announce: bool) {
        {
            let mut state = self.state();
            if !state.peers.contains(&peer) {
                state.peers.push(peer);
            }
        }
        if announce {
            self.ctx.occupied.new_peer(peer);
        }
    }

    /// Associate the chunk to fill. It is stamped with this download's hash.
    pub fn bind_chunk(&self, chunk: Arc<dyn Chunk>) {
        chunk.set_hash(self.hash);
        self.state().chunk = Some(chunk);
    }

    // ── Readiness ─────────────────────────────────────────────────────────────

    /// Whether an attempt can start now. Remembers the chosen peer for
    /// [`start_downloading`](Self::start_downloading).
    pub fn is_ready_to_download(&self) -> bool {
        let (candidates, chunk) = {
            let state = self.state();
            if state.peers.is_empty() || state.downloading {
                return false;
            }
            (state.peers.clone(), state.chunk.clone())
        };
        if self.is_cancelled() || chunk.is_some_and(|c| c.is_complete()) {
            return false;
        }

        let choice = self.fastest_free_peer(&candidates, None).map(|p| p.id());
        let mut state = self.state();
        if state.downloading {
            return false;
        }
        state.selected = choice;
        choice.is_some()
    }

    /// Fastest free peer among `candidates`, first one on ties.
    fn fastest_free_peer(&self, candidates: &[PeerId], excluded: Option<&PeerId>) -> Option<Arc<Peer>> {
        let mut best: Option<Arc<Peer>> = None;
        for id in candidates {
            if excluded == Some(id) || !self.ctx.occupied.is_peer_free(id) {
                continue;
            }
            let Some(peer) = self.ctx.directory.get_peer(id) else {
                continue;
            };
            if best.as_ref().map_or(true, |b| peer.speed() > b.speed()) {
                best = Some(peer);
            }
        }
        best
    }

    // ── Attempt ───────────────────────────────────────────────────────────────

    /// Start an attempt from the peer chosen by the last readiness check.
    /// Returns false, without side effects, if that is not possible.
    pub fn start_downloading(self: &Arc<Self>) -> bool {
        let (chunk, peer_id) = {
            let mut state = self.state();
            if state.downloading {
                return false;
            }
            let Some(chunk) = state.chunk.clone() else {
                tracing::warn!(chunk = self.short_hash(), "cannot start: no chunk bound");
                return false;
            };
            let Some(peer_id) = state.selected.take() else {
                tracing::warn!(chunk = self.short_hash(), "cannot start: no peer selected");
                return false;
            };
            (chunk, peer_id)
        };

        let Some(peer) = self.ctx.directory.get_peer(&peer_id) else {
            tracing::debug!(chunk = self.short_hash(), "selected peer left the directory");
            return false;
        };
        if !self.ctx.occupied.set_peer_as_occupied(peer_id) {
            tracing::debug!(
                chunk = self.short_hash(),
                peer = hex::encode(&peer_id[..8]),
                "selected peer is no longer free"
            );
            return false;
        }

        let attempt = {
            let mut state = self.state();
            state.downloading = true;
            state.current_peer = Some(peer_id);
            state.attempt += 1;
            state.attempt
        };

        let offset = chunk.known_bytes();
        self.rate().reset();
        self.received.store(0, Ordering::Relaxed);
        tracing::info!(
            chunk = self.short_hash(),
            peer = hex::encode(&peer_id[..8]),
            offset,
            "chunk download started"
        );
        let _ = self.ctx.events.send(DownloadEvent::Started {
            chunk: self.hash,
            peer: peer_id,
        });

        let this = self.clone();
        tokio::spawn(async move {
            let report = this.run_attempt(&peer, chunk, offset).await;
            this.downloading_ended(attempt, report);
        });
        true
    }

    async fn run_attempt(self: &Arc<Self>, peer: &Arc<Peer>, chunk: Arc<dyn Chunk>, offset: u64) -> AttemptReport {
        let mut cancel = self.cancel.subscribe();
        let settings = &self.ctx.settings;

        let conn = tokio::select! {
            conn = self.ctx.pool.get(peer) => conn,
            _ = cancelled(&mut cancel) => return AttemptReport::ended(AttemptOutcome::Cancelled, 0),
        };
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(chunk = self.short_hash(), peer = %peer.addr(), error = %e, "unable to reach peer");
                return AttemptReport::ended(AttemptOutcome::NetworkError, 0);
            }
        };

        let request = GetChunk {
            chunk: self.hash,
            offset,
        };
        let mut session = GetChunkSession::new(conn, request, settings.socket_timeout());
        let started = tokio::select! {
            started = session.start() => started,
            _ = cancelled(&mut cancel) => return AttemptReport::ended(AttemptOutcome::Cancelled, 0),
        };
        drop(session);

        let ChunkStream {
            connection,
            chunk_size,
        } = match started {
            Ok(stream) => stream,
            Err(e) => return AttemptReport::ended(self.handshake_failed(peer, e), 0),
        };

        if chunk_size != chunk.size() || offset > chunk_size {
            tracing::warn!(
                chunk = self.short_hash(),
                announced = chunk_size,
                expected = chunk.size(),
                offset,
                "peer announced an unexpected chunk size"
            );
            connection.finished(true);
            return AttemptReport::ended(AttemptOutcome::ProtocolError, 0);
        }
        self.state().announced_size = Some(chunk_size);

        let writer = match chunk.data_writer() {
            Ok(writer) => writer,
            Err(e) => {
                tracing::warn!(chunk = self.short_hash(), error = %e, "unable to write chunk");
                connection.finished(true);
                return AttemptReport::ended(AttemptOutcome::StorageError, 0);
            }
        };

        let detached = match self.prepare_stream(connection) {
            Ok(detached) => detached,
            Err(e) => {
                tracing::warn!(chunk = self.short_hash(), error = %e, "unable to hand the connection to a worker");
                return AttemptReport::ended(AttemptOutcome::NetworkError, 0);
            }
        };

        let report = self.stream_on_worker(detached, writer, peer.clone(), chunk_size - offset).await;
        self.abort_slot().take();
        report
    }

    fn handshake_failed(&self, peer: &Peer, error: HandshakeError) -> AttemptOutcome {
        let outcome = match &error {
            HandshakeError::Status(_) | HandshakeError::Timeout(_) => AttemptOutcome::HandshakeFailed,
            HandshakeError::MissingChunkSize | HandshakeError::Detached => AttemptOutcome::ProtocolError,
            HandshakeError::Connection(_) => AttemptOutcome::NetworkError,
        };
        tracing::warn!(
            chunk = self.short_hash(),
            peer = hex::encode(&peer.id()[..8]),
            error = %error,
            "chunk request failed"
        );
        outcome
    }

    /// Detach the connection for blocking reads and make it abortable.
    fn prepare_stream(&self, connection: PeerConnection) -> io::Result<DetachedConnection> {
        let detached = connection
            .detach()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        detached.set_read_timeout(self.ctx.settings.timeout_during_transfer())?;
        let handle = detached.abort_handle()?;
        let mut slot = self.abort_slot();
        if self.is_cancelled() {
            handle.abort();
        }
        *slot = Some(handle);
        Ok(detached)
    }

    /// Run the transfer loop on its own thread and wait for it.
    async fn stream_on_worker(
        self: &Arc<Self>,
        mut detached: DetachedConnection,
        mut writer: Box<dyn ChunkWriter>,
        peer: Arc<Peer>,
        remaining: u64,
    ) -> AttemptReport {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("chunk-{}", hex::encode(&self.hash[..4])))
            .spawn(move || {
                let outcome = this.transfer(&mut detached, writer.as_mut(), &peer, remaining);
                let _ = tx.send((outcome, detached));
            });
        if let Err(e) = spawned {
            tracing::error!(chunk = self.short_hash(), error = %e, "failed to spawn transfer thread");
            return AttemptReport::ended(AttemptOutcome::NetworkError, 0);
        }

        match rx.await {
            Ok((AttemptOutcome::Completed, detached)) => {
                let connection = match detached.reattach() {
                    Ok(conn) => Some(conn),
                    Err(e) => {
                        tracing::debug!(error = %e, "unable to reattach connection");
                        None
                    }
                };
                AttemptReport {
                    outcome: AttemptOutcome::Completed,
                    bytes: self.received.load(Ordering::Relaxed),
                    connection,
                }
            }
            // The connection is mid-stream; dropping it closes it.
            Ok((outcome, _detached)) => AttemptReport::ended(outcome, self.received.load(Ordering::Relaxed)),
            Err(_) => {
                tracing::error!(chunk = self.short_hash(), "transfer thread ended without reporting");
                AttemptReport::ended(AttemptOutcome::NetworkError, self.received.load(Ordering::Relaxed))
            }
        }
    }

    /// Blocking transfer loop. Runs on the worker thread.
    fn transfer(
        &self,
        conn: &mut DetachedConnection,
        writer: &mut dyn ChunkWriter,
        peer: &Peer,
        remaining: u64,
    ) -> AttemptOutcome {
        let mut buf = vec![0u8; self.ctx.settings.buffer_size.max(1) as usize];
        let mut received = 0u64;
        let mut last_check = Instant::now();
        let mut received_at_check = 0u64;

        while received < remaining {
            if self.is_cancelled() {
                return AttemptOutcome::Cancelled;
            }

            let want = buf.len().min((remaining - received) as usize);
            let n = match conn.read(&mut buf[..want]) {
                Ok(0) => {
                    tracing::warn!(chunk = self.short_hash(), received, remaining, "peer closed the stream");
                    return self.network_failure();
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let timed_out = matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut);
                    tracing::warn!(
                        chunk = self.short_hash(),
                        received,
                        remaining,
                        timed_out,
                        error = %e,
                        "chunk stream interrupted"
                    );
                    return self.network_failure();
                }
            };

            if let Err(e) = writer.write(&buf[..n]) {
                tracing::warn!(chunk = self.short_hash(), error = %e, "unable to write chunk");
                return AttemptOutcome::StorageError;
            }
            received += n as u64;
            self.received.store(received, Ordering::Relaxed);
            self.rate().add_data(n);

            let elapsed = last_check.elapsed();
            if received < remaining && elapsed >= SPEED_RECHECK_PERIOD {
                let millis = elapsed.as_millis().max(1) as u64;
                let speed = (received - received_at_check).saturating_mul(1000) / millis;
                peer.set_speed(speed);
                last_check = Instant::now();
                received_at_check = received;

                if self.should_switch_peer(peer) {
                    return AttemptOutcome::Superseded;
                }
            }
        }
        AttemptOutcome::Completed
    }

    fn network_failure(&self) -> AttemptOutcome {
        if self.is_cancelled() {
            AttemptOutcome::Cancelled
        } else {
            AttemptOutcome::NetworkError
        }
    }

    fn should_switch_peer(&self, current: &Peer) -> bool {
        let candidates = self.state().peers.clone();
        let candidate = self
            .fastest_free_peer(&candidates, Some(&current.id()))
            .map(|p| p.speed());
        let switch = should_switch(current.speed(), candidate, &self.ctx.settings);
        if switch {
            tracing::debug!(
                chunk = self.short_hash(),
                current = current.speed(),
                candidate = ?candidate,
                "switching to a faster peer"
            );
        }
        switch
    }

    /// End of an attempt, on every path. A second call for the same attempt
    /// does nothing.
    fn downloading_ended(&self, attempt: u64, report: AttemptReport) {
        let peer = {
            let mut state = self.state();
            if !state.downloading || state.attempt != attempt {
                return;
            }
            state.downloading = false;
            state.current_peer.take()
        };

        if let Some(conn) = report.connection {
            conn.finished(report.outcome != AttemptOutcome::Completed);
        }
        self.rate().reset();
        if let Some(peer) = peer {
            self.ctx.occupied.set_peer_as_free(peer);
        }

        match report.outcome {
            AttemptOutcome::Completed => tracing::info!(
                chunk = self.short_hash(),
                bytes = report.bytes,
                "chunk download completed"
            ),
            outcome if outcome.is_error() => tracing::warn!(
                chunk = self.short_hash(),
                bytes = report.bytes,
                ?outcome,
                "chunk download attempt failed"
            ),
            outcome => tracing::debug!(
                chunk = self.short_hash(),
                bytes = report.bytes,
                ?outcome,
                "chunk download attempt ended"
            ),
        }

        let _ = self.ctx.events.send(DownloadEvent::Finished {
            chunk: self.hash,
            peer,
            bytes: report.bytes,
            outcome: report.outcome,
        });
    }

    /// Stop for good. A transfer in progress ends as [`AttemptOutcome::Cancelled`].
    pub fn abort(&self) {
        self.cancel.send_replace(true);
        if let Some(handle) = self.abort_slot().as_ref() {
            handle.abort();
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn hash(&self) -> ChunkHash {
        self.hash
    }

    /// Bytes/s over the current attempt.
    pub fn download_rate(&self) -> u64 {
        self.rate().transfer_rate()
    }

    pub fn is_downloading(&self) -> bool {
        self.state().downloading
    }

    pub fn is_complete(&self) -> bool {
        self.chunk().is_some_and(|c| c.is_complete())
    }

    pub fn has_at_least_a_peer(&self) -> bool {
        !self.state().peers.is_empty()
    }

    /// Bytes of the chunk already written.
    pub fn downloaded_bytes(&self) -> u64 {
        self.chunk().map(|c| c.known_bytes()).unwrap_or(0)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.state().peers.clone()
    }

    pub fn current_peer(&self) -> Option<PeerId> {
        self.state().current_peer
    }

    pub fn chunk(&self) -> Option<Arc<dyn Chunk>> {
        self.state().chunk.clone()
    }

    /// Chunk size announced by the last accepted request.
    pub fn announced_size(&self) -> Option<u64> {
        self.state().announced_size
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}
