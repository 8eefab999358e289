//! Persisted named values in the node's data directory.
//!
//! Values are serde types stored one per file. Writes go to `<name>.temp`
//! and are renamed over the target, so a reader never sees a half-written
//! value.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

const TEMP_SUFFIX: &str = ".temp";

#[derive(Debug, thiserror::Error)]
pub enum PersistentError {
    #[error("no persisted value named {0}")]
    UnknownValue(String),
    #[error("failed to write {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to encode {0}: {1}")]
    Encode(String, serde_json::Error),
    #[error("failed to decode {0}: {1}")]
    Decode(String, serde_json::Error),
}

/// Named values stored under one directory.
#[derive(Debug, Clone)]
pub struct PersistentData {
    dir: PathBuf,
}

impl PersistentData {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `value` under `name`. Human-readable values are pretty-printed.
    pub fn set_value<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        human_readable: bool,
    ) -> Result<(), PersistentError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PersistentError::Io(self.dir.clone(), e))?;

        let path = self.dir.join(name);
        let temp_path = self.dir.join(format!("{name}{TEMP_SUFFIX}"));

        let bytes = if human_readable {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        }
        .map_err(|e| PersistentError::Encode(name.to_string(), e))?;

        std::fs::write(&temp_path, bytes).map_err(|e| PersistentError::Io(temp_path.clone(), e))?;
        std::fs::rename(&temp_path, &path).map_err(|e| PersistentError::Io(path.clone(), e))?;
        Ok(())
    }

    /// Load the value stored under `name`.
    pub fn get_value<T: DeserializeOwned>(&self, name: &str) -> Result<T, PersistentError> {
        let path = self.dir.join(name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistentError::UnknownValue(name.to_string()))
            }
            Err(e) => return Err(PersistentError::Io(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| PersistentError::Decode(name.to_string(), e))
    }

    /// Remove a value. Returns false if it didn't exist.
    pub fn rm_value(&self, name: &str) -> bool {
        std::fs::remove_file(self.dir.join(name)).is_ok()
    }
}
