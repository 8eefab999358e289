//! shoal-services: the chunk transfer engine.
//!
//! Downloading side: [`FileDownload`] schedules one [`ChunkDownload`] per
//! chunk, each fetching from the fastest free peer over the peer protocol.
//! Serving side: [`Uploader`] answers chunk requests from the [`ChunkStore`].

pub mod chunk;
pub mod chunk_download;
pub mod connection;
pub mod get_chunk;
pub mod occupied;
pub mod peer;
pub mod rate;
pub mod scheduler;
pub mod store;
pub mod uploader;

pub use chunk::{Chunk, ChunkError, ChunkWriter, MemoryChunk};
pub use chunk_download::{should_switch, AttemptOutcome, ChunkDownload, DownloadContext, DownloadEvent};
pub use connection::{ConnectionError, ConnectionPool, DetachedConnection, PeerConnection};
pub use get_chunk::{ChunkStream, GetChunkSession, HandshakeError};
pub use occupied::OccupiedPeers;
pub use peer::{Peer, PeerDirectory, PeerRegistry};
pub use rate::RateEstimator;
pub use scheduler::{DownloadSummary, FileDownload};
pub use store::{ChunkStore, StoredChunk};
pub use uploader::Uploader;
