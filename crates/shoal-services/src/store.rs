//! Content-addressed chunk store.
//!
//! Chunks live by hash in a two-level directory structure:
//!   {root}/{hash[0..2]}/{full_hash}
//!
//! A chunk being downloaded is appended to `{full_hash}.part` and renamed to
//! its final name once every byte is written. A final file is immutable.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use bytes::Bytes;
use memmap2::Mmap;
use shoal_core::ChunkHash;

use crate::chunk::{Chunk, ChunkError, ChunkWriter};

const PART_EXTENSION: &str = "part";

#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Open a store rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create chunk store: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True if the complete chunk is stored.
    pub fn has(&self, hash: &ChunkHash) -> bool {
        chunk_path(&self.root, hash).exists()
    }

    /// Contents of a complete chunk, or `None` if it is not stored.
    pub fn read(&self, hash: &ChunkHash) -> Result<Option<Bytes>> {
        let path = chunk_path(&self.root, hash);
        if !path.exists() {
            return Ok(None);
        }

        let file =
            File::open(&path).with_context(|| format!("failed to open chunk: {}", path.display()))?;

        // Safety: final chunk files are never modified in place.
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("failed to mmap chunk: {}", path.display()))?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    /// Store a complete chunk. Storing an existing hash is a no-op.
    pub fn put(&self, hash: &ChunkHash, data: &[u8]) -> Result<()> {
        let path = chunk_path(&self.root, hash);
        if path.exists() {
            return Ok(());
        }
        ensure_parent(&path)?;

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(data).context("failed to write chunk data")?;
            file.sync_all().context("failed to sync chunk to disk")?;
        }
        fs::rename(&tmp_path, &path).with_context(|| {
            format!("failed to rename {} to {}", tmp_path.display(), path.display())
        })?;

        tracing::trace!(hash = hex::encode(&hash[..8]), size = data.len(), "chunk stored");
        Ok(())
    }

    /// A writable handle on a chunk of known size, complete or not.
    pub fn chunk(&self, hash: ChunkHash, size: u64) -> Arc<StoredChunk> {
        Arc::new(StoredChunk {
            root: self.root.clone(),
            hash: Mutex::new(hash),
            size,
            deleted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Number of complete chunks.
    pub fn count(&self) -> usize {
        self.complete_files().count()
    }

    /// Bytes held by complete chunks.
    pub fn size(&self) -> u64 {
        self.complete_files()
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    fn complete_files(&self) -> impl Iterator<Item = fs::DirEntry> {
        fs::read_dir(&self.root)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|dir| fs::read_dir(dir.path()).ok())
            .flat_map(|entries| entries.flatten())
            .filter(|entry| entry.path().extension().is_none())
    }
}

fn chunk_path(root: &Path, hash: &ChunkHash) -> PathBuf {
    let hex = hex::encode(hash);
    root.join(&hex[0..2]).join(&hex)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create chunk dir: {}", parent.display()))?;
    }
    Ok(())
}

// ── Stored chunk ──────────────────────────────────────────────────────────────

/// A chunk backed by the store's files.
#[derive(Debug)]
pub struct StoredChunk {
    root: PathBuf,
    hash: Mutex<ChunkHash>,
    size: u64,
    deleted: Arc<AtomicBool>,
}

impl StoredChunk {
    fn final_path(&self) -> PathBuf {
        chunk_path(&self.root, &self.current_hash())
    }

    fn part_path(&self) -> PathBuf {
        self.final_path().with_extension(PART_EXTENSION)
    }

    fn current_hash(&self) -> ChunkHash {
        *self.hash.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove every byte of the chunk. Open writers fail from now on.
    pub fn delete(&self) {
        self.deleted.store(true, Ordering::Relaxed);
        let _ = fs::remove_file(self.part_path());
        let _ = fs::remove_file(self.final_path());
    }
}

impl Chunk for StoredChunk {
    fn hash(&self) -> Option<ChunkHash> {
        Some(self.current_hash())
    }

    fn set_hash(&self, hash: ChunkHash) {
        *self.hash.lock().unwrap_or_else(PoisonError::into_inner) = hash;
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn known_bytes(&self) -> u64 {
        if self.final_path().exists() {
            return self.size;
        }
        fs::metadata(self.part_path()).map(|m| m.len()).unwrap_or(0)
    }

    fn data_writer(&self) -> Result<Box<dyn ChunkWriter>, ChunkError> {
        if self.deleted.load(Ordering::Relaxed) {
            return Err(ChunkError::Deleted);
        }
        let final_path = self.final_path();
        let part_path = self.part_path();
        if let Some(parent) = part_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ChunkError::UnableToOpenForWrite(part_path.clone(), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .map_err(|e| ChunkError::UnableToOpenForWrite(part_path.clone(), e))?;
        let written = file.metadata()?.len();

        Ok(Box::new(StoredWriter {
            file,
            written,
            size: self.size,
            part_path,
            final_path,
            deleted: self.deleted.clone(),
        }))
    }
}

struct StoredWriter {
    file: File,
    written: u64,
    size: u64,
    part_path: PathBuf,
    final_path: PathBuf,
    deleted: Arc<AtomicBool>,
}

impl ChunkWriter for StoredWriter {
    fn write(&mut self, buf: &[u8]) -> Result<(), ChunkError> {
        if self.deleted.load(Ordering::Relaxed) {
            return Err(ChunkError::Deleted);
        }
        let len = buf.len() as u64;
        if self.written + len > self.size {
            return Err(ChunkError::WriteBeyondEnd {
                offset: self.written,
                len,
                size: self.size,
            });
        }

        self.file.write_all(buf)?;
        self.written += len;

        if self.written == self.size {
            self.file.sync_all()?;
            fs::rename(&self.part_path, &self.final_path)?;
            tracing::trace!(path = %self.final_path.display(), "chunk completed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_store() -> ChunkStore {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir =
            std::env::temp_dir().join(format!("shoal-store-test-{}-{}", std::process::id(), id));
        let _ = fs::remove_dir_all(&dir);
        ChunkStore::new(&dir).unwrap()
    }

    #[test]
    fn put_and_read() {
        let store = temp_store();
        let data = b"hello world";
        let hash = shoal_core::crypto::hash(data);

        assert!(!store.has(&hash));
        store.put(&hash, data).unwrap();
        assert!(store.has(&hash));
        assert_eq!(&store.read(&hash).unwrap().unwrap()[..], data);
        assert!(store.read(&[0; 32]).unwrap().is_none());

        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn two_level_layout() {
        let store = temp_store();
        let hash = shoal_core::crypto::hash(b"layout");
        store.put(&hash, b"layout").unwrap();

        let hex = hex::encode(hash);
        assert!(store.root().join(&hex[0..2]).join(&hex).exists());

        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn stored_chunk_resumes_and_completes() {
        let store = temp_store();
        let data = b"0123456789";
        let hash = shoal_core::crypto::hash(data);
        let chunk = store.chunk(hash, data.len() as u64);

        chunk.data_writer().unwrap().write(&data[..4]).unwrap();
        assert_eq!(chunk.known_bytes(), 4);
        assert!(!store.has(&hash));

        // A fresh writer appends after the known bytes.
        let mut writer = chunk.data_writer().unwrap();
        writer.write(&data[4..]).unwrap();
        assert!(chunk.is_complete());
        assert_eq!(&store.read(&hash).unwrap().unwrap()[..], data);

        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn writing_past_the_end_fails() {
        let store = temp_store();
        let chunk = store.chunk([9; 32], 3);
        let err = chunk.data_writer().unwrap().write(b"abcd").unwrap_err();
        assert!(matches!(err, ChunkError::WriteBeyondEnd { offset: 0, len: 4, size: 3 }));

        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn deleted_chunk_stops_writers() {
        let store = temp_store();
        let chunk = store.chunk([3; 32], 8);
        let mut writer = chunk.data_writer().unwrap();
        writer.write(b"ab").unwrap();
        chunk.delete();

        assert!(matches!(writer.write(b"cd"), Err(ChunkError::Deleted)));
        assert_eq!(chunk.known_bytes(), 0);

        let _ = fs::remove_dir_all(store.root());
    }

    #[test]
    fn partial_chunks_are_not_counted() {
        let store = temp_store();
        store.put(&[1; 32], b"abc").unwrap();
        store.chunk([2; 32], 10).data_writer().unwrap().write(b"xy").unwrap();

        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 3);

        let _ = fs::remove_dir_all(store.root());
    }
}
