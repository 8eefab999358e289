//! Writable chunk abstraction consumed by the chunk engine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use shoal_core::ChunkHash;

/// Storage failures while writing a chunk. All are recoverable at the
/// download level.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("unable to open {0} for writing: {1}")]
    UnableToOpenForWrite(PathBuf, std::io::Error),
    #[error("chunk I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk was deleted while being written")]
    Deleted,
    #[error("write of {len} bytes at offset {offset} goes beyond the chunk end ({size})")]
    WriteBeyondEnd { offset: u64, len: u64, size: u64 },
}

/// A chunk that can be filled from the network.
pub trait Chunk: Send + Sync {
    fn hash(&self) -> Option<ChunkHash>;

    /// Bind the chunk to a content hash.
    fn set_hash(&self, hash: ChunkHash);

    /// Total size of the chunk, bytes.
    fn size(&self) -> u64;

    /// Bytes already written, from the start of the chunk.
    fn known_bytes(&self) -> u64;

    fn is_complete(&self) -> bool {
        self.known_bytes() >= self.size()
    }

    /// Sequential writer appending at `known_bytes()`.
    fn data_writer(&self) -> Result<Box<dyn ChunkWriter>, ChunkError>;
}

pub trait ChunkWriter: Send {
    fn write(&mut self, buf: &[u8]) -> Result<(), ChunkError>;
}

// ── In-memory chunk ───────────────────────────────────────────────────────────

/// A chunk held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryChunk {
    inner: Arc<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    hash: Mutex<Option<ChunkHash>>,
    data: Mutex<Vec<u8>>,
    size: u64,
    deleted: AtomicBool,
}

impl MemoryChunk {
    pub fn new(size: u64) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                hash: Mutex::new(None),
                data: Mutex::new(Vec::new()),
                size,
                deleted: AtomicBool::new(false),
            }),
        }
    }

    /// A chunk whose first bytes are already known.
    pub fn with_prefix(size: u64, prefix: &[u8]) -> Self {
        let chunk = Self::new(size);
        chunk
            .inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(prefix);
        chunk
    }

    pub fn data(&self) -> Vec<u8> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Make every further write fail with [`ChunkError::Deleted`].
    pub fn delete(&self) {
        self.inner.deleted.store(true, Ordering::Relaxed);
    }
}

impl Chunk for MemoryChunk {
    fn hash(&self) -> Option<ChunkHash> {
        *self.inner.hash.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_hash(&self, hash: ChunkHash) {
        *self.inner.hash.lock().unwrap_or_else(PoisonError::into_inner) = Some(hash);
    }

    fn size(&self) -> u64 {
        self.inner.size
    }

    fn known_bytes(&self) -> u64 {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    fn data_writer(&self) -> Result<Box<dyn ChunkWriter>, ChunkError> {
        if self.inner.deleted.load(Ordering::Relaxed) {
            return Err(ChunkError::Deleted);
        }
        Ok(Box::new(MemoryWriter {
            inner: self.inner.clone(),
        }))
    }
}

struct MemoryWriter {
    inner: Arc<MemoryInner>,
}

impl ChunkWriter for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> Result<(), ChunkError> {
        if self.inner.deleted.load(Ordering::Relaxed) {
            return Err(ChunkError::Deleted);
        }
        let mut data = self.inner.data.lock().unwrap_or_else(PoisonError::into_inner);
        let offset = data.len() as u64;
        if offset + buf.len() as u64 > self.inner.size {
            return Err(ChunkError::WriteBeyondEnd {
                offset,
                len: buf.len() as u64,
                size: self.inner.size,
            });
        }
        data.extend_from_slice(buf);
        Ok(())
    }
}
