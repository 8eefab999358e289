//! Full transfers against a real uploader.

use std::sync::Arc;
use std::time::Duration;

use shoal_core::crypto;
use shoal_core::PeerId;
use shoal_services::{AttemptOutcome, Chunk, ChunkStore, ConnectionPool, DownloadEvent, FileDownload, MemoryChunk, PeerRegistry};
use tokio::sync::broadcast;

use crate::{start_uploader, temp_dir, test_data, test_settings, Downloader, OUR_ID};

const UPLOADER_ID: PeerId = [0x11; 32];

#[tokio::test]
async fn one_mebibyte_chunk_from_uploader() {
    let data = test_data(1024 * 1024);
    let hash = crypto::hash(&data);
    let source = ChunkStore::new(temp_dir("transfer-source")).unwrap();
    source.put(&hash, &data).unwrap();
    let (addr, stop) = start_uploader(source.clone(), UPLOADER_ID).await.unwrap();

    let mut node = Downloader::new(hash, test_settings());
    node.registry.upsert(UPLOADER_ID, addr);
    let chunk = MemoryChunk::new(data.len() as u64);
    node.download.bind_chunk(Arc::new(chunk.clone()));
    node.download.add_peer(UPLOADER_ID);

    assert!(node.download.is_ready_to_download());
    assert!(node.download.start_downloading());

    let event = node.finished(Duration::from_secs(10)).await;
    assert_eq!(
        event,
        DownloadEvent::Finished {
            chunk: hash,
            peer: Some(UPLOADER_ID),
            bytes: data.len() as u64,
            outcome: AttemptOutcome::Completed,
        }
    );
    assert!(chunk.is_complete());
    assert!(chunk.data() == data);
    assert!(node.download.is_complete());
    assert!(!node.download.is_downloading());
    assert!(node.occupied.is_peer_free(&UPLOADER_ID));
    // The stream was consumed to the end, so the connection is reusable.
    assert_eq!(node.pool.idle_count(&UPLOADER_ID), 1);

    let _ = stop.send(());
    let _ = std::fs::remove_dir_all(source.root());
}

#[tokio::test]
async fn file_download_fills_the_local_store() {
    let source = ChunkStore::new(temp_dir("file-source")).unwrap();
    let target = ChunkStore::new(temp_dir("file-target")).unwrap();
    let content = test_data(700 * 1024);
    let mut chunks = Vec::new();
    for part in content.chunks(256 * 1024) {
        let hash = crypto::hash(part);
        source.put(&hash, part).unwrap();
        chunks.push((hash, part.len() as u64));
    }
    let (addr, stop) = start_uploader(source.clone(), UPLOADER_ID).await.unwrap();

    let registry = PeerRegistry::new(test_settings().lan_speed);
    registry.upsert(UPLOADER_ID, addr);
    let (_shutdown, rx) = broadcast::channel(1);
    let mut download = FileDownload::new(
        Arc::new(registry),
        ConnectionPool::new(OUR_ID, test_settings().socket_timeout()),
        test_settings(),
        rx,
    );
    for (hash, size) in &chunks {
        download.add_chunk(*hash, target.chunk(*hash, *size), &[UPLOADER_ID]);
    }

    let summary = tokio::time::timeout(Duration::from_secs(20), download.run())
        .await
        .unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.bytes, content.len() as u64);
    assert_eq!(summary.failed_attempts, 0);

    let mut rebuilt = Vec::new();
    for (hash, _) in &chunks {
        rebuilt.extend_from_slice(&target.read(hash).unwrap().unwrap());
    }
    assert!(rebuilt == content);

    let _ = stop.send(());
    let _ = std::fs::remove_dir_all(source.root());
    let _ = std::fs::remove_dir_all(target.root());
}

#[tokio::test]
async fn uploader_without_the_chunk_refuses() {
    let source = ChunkStore::new(temp_dir("refuse-source")).unwrap();
    let (addr, stop) = start_uploader(source.clone(), UPLOADER_ID).await.unwrap();

    let hash = [0x42; 32];
    let mut node = Downloader::new(hash, test_settings());
    node.registry.upsert(UPLOADER_ID, addr);
    let chunk = MemoryChunk::new(4096);
    node.download.bind_chunk(Arc::new(chunk.clone()));
    node.download.add_peer(UPLOADER_ID);

    assert!(node.download.is_ready_to_download());
    assert!(node.download.start_downloading());

    match node.finished(Duration::from_secs(5)).await {
        DownloadEvent::Finished { outcome, bytes, .. } => {
            assert_eq!(outcome, AttemptOutcome::HandshakeFailed);
            assert_eq!(bytes, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(chunk.known_bytes(), 0);
    assert!(node.occupied.is_peer_free(&UPLOADER_ID));

    let _ = stop.send(());
    let _ = std::fs::remove_dir_all(source.root());
}
