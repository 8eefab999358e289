//! Peer directory: the peers chunks can be fetched from.
//!
//! Discovery happens elsewhere; this is only lookup by identity plus the
//! per-peer speed the chunk engine observes while downloading.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use shoal_core::PeerId;

/// A remote peer able to serve chunks.
///
/// `speed` is written by whichever chunk download is currently receiving
/// from this peer and read by every other one.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    /// Last observed download speed, bytes/s.
    speed: AtomicU64,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, initial_speed: u64) -> Self {
        Self {
            id,
            addr,
            speed: AtomicU64::new(initial_speed),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn speed(&self) -> u64 {
        self.speed.load(Ordering::Relaxed)
    }

    pub fn set_speed(&self, bytes_per_sec: u64) {
        self.speed.store(bytes_per_sec, Ordering::Relaxed);
    }
}

/// Lookup of peers by identity.
pub trait PeerDirectory: Send + Sync {
    fn get_peer(&self, id: &PeerId) -> Option<Arc<Peer>>;
}

/// The peer registry, shared by every download and by the control listener.
/// Keyed on peer identity.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: Arc<DashMap<PeerId, Arc<Peer>>>,
    /// Speed assumed for a peer nothing has been downloaded from yet.
    initial_speed: u64,
}

impl PeerRegistry {
    pub fn new(initial_speed: u64) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            initial_speed,
        }
    }

    /// Insert a peer, or move a known one to a new address.
    ///
    /// A peer whose address is unchanged keeps its observed speed.
    pub fn upsert(&self, id: PeerId, addr: SocketAddr) -> Arc<Peer> {
        let mut entry = self
            .peers
            .entry(id)
            .or_insert_with(|| Arc::new(Peer::new(id, addr, self.initial_speed)));
        if entry.addr() != addr {
            let speed = entry.speed();
            *entry = Arc::new(Peer::new(id, addr, speed));
        }
        entry.value().clone()
    }

    pub fn remove(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.remove(id).map(|(_, peer)| peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }
}

impl PeerDirectory for PeerRegistry {
    fn get_peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|e| e.value().clone())
    }
}
