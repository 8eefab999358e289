//! Transfers that stall midway: resuming from the bytes already written, and aborting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal_core::config::TransferSettings;
use shoal_core::PeerId;
use shoal_services::{AttemptOutcome, Chunk, ChunkStore, ConnectionPool, DownloadEvent, FileDownload, MemoryChunk, PeerRegistry};
use tokio::sync::broadcast;

use crate::{fake_peer, temp_dir, test_data, test_settings, Behavior, Downloader, OUR_ID};

const PEER_ID: PeerId = [0x44; 32];
const STALL_AFTER: usize = 256 * 1024;

#[tokio::test]
async fn stalled_stream_resumes_at_known_bytes() {
    let data = Arc::new(test_data(1024 * 1024));
    let mut peer = fake_peer(PEER_ID, data.clone(), Behavior::StallOnce { after: STALL_AFTER })
        .await
        .unwrap();

    let mut node = Downloader::new([0x55; 32], test_settings());
    node.registry.upsert(PEER_ID, peer.addr);
    let chunk = MemoryChunk::new(data.len() as u64);
    node.download.bind_chunk(Arc::new(chunk.clone()));
    node.download.add_peer(PEER_ID);

    assert!(node.download.is_ready_to_download());
    assert!(node.download.start_downloading());
    match node.finished(Duration::from_secs(5)).await {
        DownloadEvent::Finished { outcome, bytes, .. } => {
            assert_eq!(outcome, AttemptOutcome::NetworkError);
            assert_eq!(bytes, STALL_AFTER as u64);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(chunk.known_bytes(), STALL_AFTER as u64);
    assert_eq!(node.pool.idle_count(&PEER_ID), 0);

    assert!(node.download.is_ready_to_download());
    assert!(node.download.start_downloading());
    match node.finished(Duration::from_secs(5)).await {
        DownloadEvent::Finished { outcome, bytes, .. } => {
            assert_eq!(outcome, AttemptOutcome::Completed);
            assert_eq!(bytes, (data.len() - STALL_AFTER) as u64);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(chunk.data() == *data);

    assert_eq!(peer.requests.recv().await.unwrap().offset, 0);
    assert_eq!(peer.requests.recv().await.unwrap().offset, STALL_AFTER as u64);
}

#[tokio::test]
async fn scheduler_retries_a_stalled_chunk() {
    let data = Arc::new(test_data(512 * 1024));
    let peer = fake_peer(PEER_ID, data.clone(), Behavior::StallOnce { after: 100_000 })
        .await
        .unwrap();
    let target = ChunkStore::new(temp_dir("resume-target")).unwrap();
    let hash = [0x66; 32];

    let registry = PeerRegistry::new(test_settings().lan_speed);
    registry.upsert(PEER_ID, peer.addr);
    let (_shutdown, rx) = broadcast::channel(1);
    let mut download = FileDownload::new(
        Arc::new(registry),
        ConnectionPool::new(OUR_ID, test_settings().socket_timeout()),
        test_settings(),
        rx,
    );
    download.add_chunk(hash, target.chunk(hash, data.len() as u64), &[PEER_ID]);

    let summary = tokio::time::timeout(Duration::from_secs(15), download.run())
        .await
        .unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.attempts, 2);
    assert_eq!(summary.failed_attempts, 1);
    assert_eq!(summary.bytes, data.len() as u64);
    assert!(target.read(&hash).unwrap().unwrap() == data.as_slice());

    let _ = std::fs::remove_dir_all(target.root());
}

#[tokio::test]
async fn abort_unblocks_a_stalled_stream() {
    const RECEIVED: usize = 64 * 1024;
    let data = Arc::new(test_data(1024 * 1024));
    let peer = fake_peer(PEER_ID, data.clone(), Behavior::StallOnce { after: RECEIVED })
        .await
        .unwrap();

    // Only the abort can end the attempt before the deadline below.
    let settings = TransferSettings {
        timeout_during_transfer: 30_000,
        ..test_settings()
    };
    let mut node = Downloader::new([0x57; 32], settings);
    node.registry.upsert(PEER_ID, peer.addr);
    node.download.bind_chunk(Arc::new(MemoryChunk::new(data.len() as u64)));
    node.download.add_peer(PEER_ID);
    assert!(node.download.is_ready_to_download());
    assert!(node.download.start_downloading());

    let deadline = Instant::now() + Duration::from_secs(5);
    while node.download.downloaded_bytes() < RECEIVED as u64 {
        assert!(Instant::now() < deadline, "stream never reached the stall");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(node.download.is_downloading());

    let aborted = Instant::now();
    node.download.abort();
    match node.finished(Duration::from_secs(5)).await {
        DownloadEvent::Finished { outcome, bytes, peer, .. } => {
            assert_eq!(outcome, AttemptOutcome::Cancelled);
            assert_eq!(bytes, RECEIVED as u64);
            assert_eq!(peer, Some(PEER_ID));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(aborted.elapsed() < Duration::from_secs(5));
    assert!(!node.download.is_downloading());
    assert!(node.occupied.is_peer_free(&PEER_ID));
    assert!(!node.download.is_ready_to_download());
}
