//! Abandoning a slow peer for a faster free one.

use std::sync::Arc;
use std::time::Duration;

use shoal_core::crypto;
use shoal_core::PeerId;
use shoal_services::{ChunkStore, ConnectionPool, FileDownload, MemoryChunk, PeerDirectory, PeerRegistry};
use tokio::sync::broadcast;

use crate::{fake_peer, start_uploader, temp_dir, test_data, test_settings, Behavior, OUR_ID};

const SLOW_ID: PeerId = [0x77; 32];
const FAST_ID: PeerId = [0x88; 32];

#[tokio::test]
async fn slow_peer_is_superseded() {
    let data = test_data(1024 * 1024);
    let hash = crypto::hash(&data);

    // About 80 KB/s, far under the switch threshold.
    let slow = fake_peer(
        SLOW_ID,
        Arc::new(data.clone()),
        Behavior::Trickle {
            piece: 4096,
            every: Duration::from_millis(50),
        },
    )
    .await
    .unwrap();
    let source = ChunkStore::new(temp_dir("switch-source")).unwrap();
    source.put(&hash, &data).unwrap();
    let (fast_addr, stop) = start_uploader(source.clone(), FAST_ID).await.unwrap();

    let settings = test_settings();
    let registry = PeerRegistry::new(settings.lan_speed);
    registry.upsert(SLOW_ID, slow.addr);
    // Slower on paper, so the trickling peer is picked first.
    registry.upsert(FAST_ID, fast_addr).set_speed(1024 * 1024);

    let (_shutdown, rx) = broadcast::channel(1);
    let mut download = FileDownload::new(
        Arc::new(registry.clone()),
        ConnectionPool::new(OUR_ID, settings.socket_timeout()),
        settings.clone(),
        rx,
    );
    let chunk = MemoryChunk::new(data.len() as u64);
    download.add_chunk(hash, Arc::new(chunk.clone()), &[SLOW_ID, FAST_ID]);

    let summary = tokio::time::timeout(Duration::from_secs(15), download.run())
        .await
        .unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.attempts, 2);
    assert_eq!(summary.failed_attempts, 0);
    assert!(chunk.data() == data);

    assert_eq!(slow.requests_served(), 1);
    let measured = registry.get_peer(&SLOW_ID).unwrap().speed();
    assert!(measured < settings.switch_threshold(), "slow peer measured at {measured} B/s");

    let _ = stop.send(());
    let _ = std::fs::remove_dir_all(source.root());
}
