//! shoald: Shoal LAN file-sharing daemon.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use shoal_core::config::ShoalConfig;
use shoal_core::crypto::generate_peer_id;
use shoal_core::persistent::{PersistentData, PersistentError};
use shoal_core::{ChunkHash, PeerId};
use shoal_services::{ChunkStore, ConnectionPool, FileDownload, PeerRegistry, Uploader};

mod control;
mod share;

const IDENTITY_VALUE: &str = "identity";

fn print_usage() {
    println!("shoald — Shoal daemon");
    println!();
    println!("Usage: shoald [command]");
    println!();
    println!("Commands:");
    println!("  serve                 Serve stored chunks to peers (default)");
    println!("  share <file>          Store a file as chunks and print their hashes");
    println!("  fetch <hash> <size>   Download one chunk from the configured peers");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = ShoalConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ShoalConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ShoalConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["serve"] | [] => run(&config, None).await,
        ["share", path] => cmd_share(&config, Path::new(path)),
        ["fetch", hash, size] => {
            let hash = parse_hash(hash)?;
            let size = size.parse().context("size must be a number of bytes")?;
            run(&config, Some((hash, size))).await
        }
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_share(config: &ShoalConfig, path: &Path) -> Result<()> {
    let store = ChunkStore::new(&config.storage.chunk_dir)?;
    let chunks = share::share_file(&store, path, share::CHUNK_SIZE)?;
    for (hash, size) in chunks {
        println!("{} {}", hex::encode(hash), size);
    }
    Ok(())
}

/// Serve until ctrl-c. With a chunk to fetch, stop once it is downloaded.
async fn run(config: &ShoalConfig, fetch: Option<(ChunkHash, u64)>) -> Result<()> {
    let our_id = load_identity(&PersistentData::new(&config.identity.data_dir))?;
    tracing::info!(peer_id = hex::encode(&our_id[..8]), "shoald starting");

    let store = ChunkStore::new(&config.storage.chunk_dir)?;
    tracing::info!(root = %store.root().display(), chunks = store.count(), "chunk store ready");

    let registry = PeerRegistry::new(config.transfer.lan_speed);
    for peer in &config.peers {
        match parse_peer(&peer.id, &peer.addr) {
            Ok((id, addr)) => {
                registry.upsert(id, addr);
            }
            Err(e) => tracing::warn!(id = %peer.id, addr = %peer.addr, error = %e, "ignoring configured peer"),
        }
    }
    tracing::info!(count = registry.len(), "peers configured");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────
    let uploader = Uploader::new(store.clone(), our_id, config.transfer.max_uploads);
    let peer_addr = format!("{}:{}", config.network.listen_addr, config.network.peer_port);
    let peer_listener = TcpListener::bind(&peer_addr)
        .await
        .with_context(|| format!("failed to bind peer listener on {peer_addr}"))?;
    let uploader_task = tokio::spawn(uploader.clone().serve(peer_listener, shutdown_tx.subscribe()));

    let control_task = if config.network.core_port != 0 {
        let control_addr = SocketAddr::from(([127, 0, 0, 1], config.network.core_port));
        let control_listener = TcpListener::bind(control_addr)
            .await
            .with_context(|| format!("failed to bind control listener on {control_addr}"))?;
        let control =
            control::ControlListener::new(our_id, registry.clone(), store.clone(), uploader.clone());
        Some(tokio::spawn(control.run(control_listener, shutdown_tx.subscribe())))
    } else {
        None
    };

    // ── Fetch or wait for exit ───────────────────────────────────────────────
    if let Some((hash, size)) = fetch {
        let pool = ConnectionPool::new(our_id, config.transfer.socket_timeout());
        let mut download = FileDownload::new(
            Arc::new(registry.clone()),
            pool,
            config.transfer.clone(),
            shutdown_tx.subscribe(),
        );
        let peers: Vec<PeerId> = registry.all().iter().map(|p| p.id()).collect();
        download.add_chunk(hash, store.chunk(hash, size), &peers);

        let summary = download.run().await;
        if summary.is_complete() {
            println!("{} {}", hex::encode(hash), size);
        } else {
            tracing::error!(
                chunk = hex::encode(&hash[..8]),
                attempts = summary.attempts,
                interrupted = summary.interrupted,
                "chunk not downloaded"
            );
        }
        let _ = shutdown_tx.send(());
    } else {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
        tracing::info!("shutting down");
    }

    match uploader_task.await {
        Ok(Err(e)) => tracing::error!(error = %e, "uploader failed"),
        Err(e) => tracing::error!(error = %e, "uploader task panicked"),
        Ok(Ok(())) => {}
    }
    if let Some(task) = control_task {
        if let Ok(Err(e)) = task.await {
            tracing::error!(error = %e, "control listener failed");
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// The persisted node identity, created on first start.
fn load_identity(data: &PersistentData) -> Result<PeerId> {
    match data.get_value::<String>(IDENTITY_VALUE) {
        Ok(hex_id) => parse_hash(&hex_id).context("persisted identity is corrupt"),
        Err(PersistentError::UnknownValue(_)) => {
            let id = generate_peer_id();
            data.set_value(IDENTITY_VALUE, &hex::encode(id), true)
                .context("failed to persist identity")?;
            tracing::info!(dir = %data.dir().display(), "new identity generated");
            Ok(id)
        }
        Err(e) => Err(e).context("failed to load identity"),
    }
}

fn parse_hash(text: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(text).context("expected a hex string")?;
    let Ok(hash) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        bail!("expected 32 bytes, got {}", bytes.len());
    };
    Ok(hash)
}

fn parse_peer(id: &str, addr: &str) -> Result<(PeerId, SocketAddr)> {
    let id = parse_hash(id)?;
    let addr = addr.parse().with_context(|| format!("invalid socket address {addr}"))?;
    Ok((id, addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    #[test]
    fn identity_is_created_once() {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("shoald-identity-test-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        let data = PersistentData::new(&dir);

        let first = load_identity(&data).unwrap();
        let second = load_identity(&data).unwrap();
        assert_eq!(first, second);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn peers_need_a_full_identity_and_an_address() {
        let hex_id = hex::encode([3u8; 32]);
        let (id, addr) = parse_peer(&hex_id, "192.168.1.20:59487").unwrap();
        assert_eq!(id, [3; 32]);
        assert_eq!(addr.port(), 59487);

        assert!(parse_peer("abcd", "192.168.1.20:59487").is_err());
        assert!(parse_peer(&hex_id, "not-an-address").is_err());
    }
}
