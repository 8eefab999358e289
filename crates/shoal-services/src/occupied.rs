//! Peer occupancy: which peers are busy serving one of our chunk requests.
//!
//! One registry is shared by every chunk download of a file, so two chunks
//! of the same file never request from the same peer at once. The registry
//! never chooses peers; callers select a free one and then reserve it.

use std::sync::Arc;

use dashmap::DashMap;
use shoal_core::PeerId;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct OccupiedPeers {
    // peer -> occupied
    peers: Arc<DashMap<PeerId, bool>>,
    freed: Arc<Notify>,
}

impl OccupiedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer as free if it is unknown.
    pub fn new_peer(&self, peer: PeerId) {
        self.peers.entry(peer).or_insert(false);
    }

    /// Reserve a peer. Returns false if it is already occupied.
    pub fn set_peer_as_occupied(&self, peer: PeerId) -> bool {
        let mut occupied = self.peers.entry(peer).or_insert(false);
        if *occupied {
            return false;
        }
        *occupied = true;
        true
    }

    /// Release a reservation and wake whoever waits in [`peer_freed`].
    ///
    /// [`peer_freed`]: OccupiedPeers::peer_freed
    pub fn set_peer_as_free(&self, peer: PeerId) {
        let was_occupied = match self.peers.get_mut(&peer) {
            Some(mut occupied) => std::mem::replace(&mut *occupied, false),
            None => false,
        };
        // The map guard is released before anyone is woken.
        if was_occupied {
            self.freed.notify_one();
        }
    }

    /// Unknown peers are free.
    pub fn is_peer_free(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).map(|o| !*o).unwrap_or(true)
    }

    pub fn occupied_count(&self) -> usize {
        self.peers.iter().filter(|e| *e.value()).count()
    }

    /// Resolves after a peer has been freed. A free that happened while
    /// nobody was waiting is remembered.
    pub async fn peer_freed(&self) {
        self.freed.notified().await;
    }
}
