//! Chunk requests a peer answers badly, or not at all.

use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal_core::{ChunkStatus, PeerId};
use shoal_services::{AttemptOutcome, DownloadEvent, MemoryChunk};

use crate::{fake_peer, test_data, test_settings, Behavior, Downloader, FakePeer};

const PEER_ID: PeerId = [0x22; 32];

async fn attempt(behavior: Behavior) -> (Downloader, FakePeer, AttemptOutcome) {
    let data = Arc::new(test_data(64 * 1024));
    let peer = fake_peer(PEER_ID, data.clone(), behavior).await.unwrap();

    let mut node = Downloader::new([0x33; 32], test_settings());
    node.registry.upsert(PEER_ID, peer.addr);
    node.download.bind_chunk(Arc::new(MemoryChunk::new(data.len() as u64)));
    node.download.add_peer(PEER_ID);
    assert!(node.download.is_ready_to_download());
    assert!(node.download.start_downloading());

    let outcome = match node.finished(Duration::from_secs(5)).await {
        DownloadEvent::Finished { outcome, bytes, peer, .. } => {
            assert_eq!(bytes, 0);
            assert_eq!(peer, Some(PEER_ID));
            outcome
        }
        other => panic!("unexpected event {other:?}"),
    };
    assert!(node.occupied.is_peer_free(&PEER_ID));
    assert!(!node.download.is_downloading());
    (node, peer, outcome)
}

#[tokio::test]
async fn silent_peer_times_out() {
    let started = Instant::now();
    let (node, mut peer, outcome) = attempt(Behavior::Silent).await;

    assert_eq!(outcome, AttemptOutcome::HandshakeFailed);
    assert!(started.elapsed() >= test_settings().socket_timeout());
    assert_eq!(peer.requests.recv().await.unwrap().offset, 0);
    // A request left unanswered poisons the connection.
    assert_eq!(node.pool.idle_count(&PEER_ID), 0);
}

#[tokio::test]
async fn refusal_closes_the_connection() {
    let (node, peer, outcome) = attempt(Behavior::Refuse(ChunkStatus::TooManyConnections)).await;

    assert_eq!(outcome, AttemptOutcome::HandshakeFailed);
    assert_eq!(peer.requests_served(), 1);
    assert_eq!(node.pool.idle_count(&PEER_ID), 0);
}

#[tokio::test]
async fn ok_without_size_is_a_protocol_error() {
    let (node, _peer, outcome) = attempt(Behavior::OkWithoutSize).await;

    assert_eq!(outcome, AttemptOutcome::ProtocolError);
    assert!(outcome.is_error());
    assert_eq!(node.pool.idle_count(&PEER_ID), 0);
}
