//! Persisted synchronization flag
//!
//! `synced = true` means the broker has received the full resync (introspection,
//! subscriptions and every cached property) for the current session. The flag
//! lives in a small TOML file next to the database so that a restart with a
//! resumed broker session can skip the resync.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SyncFile {
    #[serde(default)]
    synced: bool,
}

#[derive(Debug)]
pub struct SyncState {
    path: PathBuf,
    synced: bool,
}

impl SyncState {
    /// Load the flag; a missing or unreadable file means "not synced".
    pub fn load(path: &Path) -> Self {
        let synced = match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<SyncFile>(&content) {
                Ok(file) => file.synced,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable sync state, forcing resync");
                    false
                }
            },
            Err(_) => false,
        };
        debug!(path = %path.display(), synced, "Sync state loaded");
        Self {
            path: path.to_path_buf(),
            synced,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Update and persist the flag. A write failure leaves the in-memory
    /// value updated.
    pub fn set(&mut self, synced: bool) {
        self.synced = synced;
        if let Err(e) = self.persist() {
            warn!(path = %self.path.display(), error = %e, "Failed to persist sync state");
        }
    }

    fn persist(&self) -> std::io::Result<()> {
        let content = toml::to_string(&SyncFile {
            synced: self.synced,
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_not_synced() {
        let dir = TempDir::new().unwrap();
        let state = SyncState::load(&dir.path().join("transportStatus.toml"));
        assert!(!state.is_synced());
    }

    #[test]
    fn test_flag_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transportStatus.toml");

        let mut state = SyncState::load(&path);
        state.set(true);

        assert!(SyncState::load(&path).is_synced());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap().trim(),
            "synced = true"
        );
    }

    #[test]
    fn test_garbage_file_forces_resync() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transportStatus.toml");
        std::fs::write(&path, "synced = maybe").unwrap();

        assert!(!SyncState::load(&path).is_synced());
    }
}
