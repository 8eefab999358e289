//! Splitting a local file into stored chunks.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use shoal_core::crypto;
use shoal_core::ChunkHash;
use shoal_services::ChunkStore;

/// Size of every chunk of a shared file but the last.
pub const CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// Store `path` chunk by chunk. Returns each chunk's hash and size, in order.
pub fn share_file(store: &ChunkStore, path: &Path, chunk_size: usize) -> Result<Vec<(ChunkHash, u64)>> {
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut chunks = Vec::new();
    let mut buf = vec![0u8; chunk_size];

    loop {
        let filled = fill(&mut file, &mut buf).with_context(|| format!("failed to read {}", path.display()))?;
        if filled == 0 {
            break;
        }
        let data = &buf[..filled];
        let hash = crypto::hash(data);
        store.put(&hash, data)?;
        tracing::debug!(hash = hex::encode(&hash[..8]), size = filled, "chunk shared");
        chunks.push((hash, filled as u64));
        if filled < chunk_size {
            break;
        }
    }
    Ok(chunks)
}

/// Read until `buf` is full or the file ends.
fn fill(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
