//! Configuration system for Shoal.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SHOAL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/shoal/config.toml
//!   3. ~/.config/shoal/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoalConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub transfer: TransferSettings,
    /// Statically known peers. Discovery is not Shoal's job.
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding persisted node data (identity, ...).
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the uploader listens on for peer connections.
    pub listen_addr: String,
    /// TCP port for peer connections. 0 = OS-assigned.
    pub peer_port: u16,
    /// Loopback port for the local control protocol. 0 = disabled.
    pub core_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the content-addressed chunk store.
    pub chunk_dir: PathBuf,
}

/// Tunables read by the chunk engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Size of a single read during a chunk transfer, bytes.
    pub buffer_size: u32,
    /// Connect and handshake timeout, milliseconds.
    pub socket_timeout: u32,
    /// Longest wait for stream bytes during a transfer, milliseconds.
    pub timeout_during_transfer: u32,
    /// Reference LAN speed, bytes/s. New peers start at this speed.
    pub lan_speed: u64,
    /// A peer slower than `lan_speed / time_recheck_chunk_factor` may be
    /// abandoned mid-transfer.
    pub time_recheck_chunk_factor: u32,
    /// A candidate must be this many times faster than the current peer.
    pub switch_to_another_peer_factor: u32,
    /// Concurrent chunk uploads served by this node.
    pub max_uploads: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Hex-encoded 32-byte peer identity.
    pub id: String,
    /// Socket address of the peer's uploader, e.g. "192.168.1.20:59487".
    pub addr: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            peer_port: 59487,
            core_port: 59485,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_dir: data_dir().join("chunks"),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            buffer_size: 65_536,
            socket_timeout: 7_000,
            timeout_during_transfer: 10_000,
            lan_speed: 10 * 1024 * 1024, // 10 MB/s
            time_recheck_chunk_factor: 4,
            switch_to_another_peer_factor: 2,
            max_uploads: 3,
        }
    }
}

impl TransferSettings {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.socket_timeout.max(1)))
    }

    pub fn timeout_during_transfer(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_during_transfer.max(1)))
    }

    /// Current-peer speed under which a switch is considered, bytes/s.
    pub fn switch_threshold(&self) -> u64 {
        self.lan_speed / u64::from(self.time_recheck_chunk_factor.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("shoal")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("shoal")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ShoalConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            ShoalConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SHOAL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ShoalConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SHOAL_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(v: Option<String>, slot: &mut T) {
            if let Some(p) = v.and_then(|v| v.parse().ok()) {
                *slot = p;
            }
        }

        if let Some(v) = lookup("SHOAL_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        parse(lookup("SHOAL_NETWORK__PEER_PORT"), &mut self.network.peer_port);
        parse(lookup("SHOAL_NETWORK__CORE_PORT"), &mut self.network.core_port);
        if let Some(v) = lookup("SHOAL_STORAGE__CHUNK_DIR") {
            self.storage.chunk_dir = PathBuf::from(v);
        }

        let t = &mut self.transfer;
        parse(lookup("SHOAL_TRANSFER__BUFFER_SIZE"), &mut t.buffer_size);
        parse(lookup("SHOAL_TRANSFER__SOCKET_TIMEOUT"), &mut t.socket_timeout);
        parse(
            lookup("SHOAL_TRANSFER__TIMEOUT_DURING_TRANSFER"),
            &mut t.timeout_during_transfer,
        );
        parse(lookup("SHOAL_TRANSFER__LAN_SPEED"), &mut t.lan_speed);
        parse(
            lookup("SHOAL_TRANSFER__TIME_RECHECK_CHUNK_FACTOR"),
            &mut t.time_recheck_chunk_factor,
        );
        parse(
            lookup("SHOAL_TRANSFER__SWITCH_TO_ANOTHER_PEER_FACTOR"),
            &mut t.switch_to_another_peer_factor,
        );
        parse(lookup("SHOAL_TRANSFER__MAX_UPLOADS"), &mut t.max_uploads);
    }
}
