//! shoal-core: shared types, wire format, and configuration.
//! All other Shoal crates depend on this one.

pub mod config;
pub mod control;
pub mod crypto;
pub mod persistent;
pub mod protocol;
pub mod wire;

pub use protocol::{ChunkStatus, GetChunk, GetChunkResult, PeerMessage};
pub use wire::{ChunkHash, PeerId, WireError, WireMessage};
