//! `patch_history.json`: which binaries were patched by which spec set.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::store::{FileLock, JsonStore, Versioned};

pub const HISTORY_VERSION: u32 = 1;
pub const HISTORY_FILE_NAME: &str = "patch_history.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchHistoryEntry {
    /// Absolute, symlink-resolved target path.
    pub path: String,
    pub specs_sha256: String,
    pub patched_sha256: String,
    pub patched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHistory {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<PatchHistoryEntry>,
}

impl Default for PatchHistory {
    fn default() -> Self {
        Self {
            version: HISTORY_VERSION,
            entries: Vec::new(),
        }
    }
}

impl Versioned for PatchHistory {
    const CURRENT_VERSION: u32 = HISTORY_VERSION;

    fn version(&self) -> u32 {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = version;
    }
}

impl PatchHistory {
    pub fn is_patched(&self, path: &str, specs_sha256: &str, current_sha256: &str) -> bool {
        self.entries.iter().any(|e| {
            e.path == path
                && e.specs_sha256 == specs_sha256
                && e.patched_sha256.eq_ignore_ascii_case(current_sha256)
        })
    }

    /// One entry per (path, spec-set hash); a second record overwrites.
    pub fn upsert(&mut self, entry: PatchHistoryEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.path == entry.path && e.specs_sha256 == entry.specs_sha256)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Remove entries for `path`, limited to one spec set when given.
    /// Returns the removed entries.
    pub fn remove(&mut self, path: &str, specs_sha256: Option<&str>) -> Vec<PatchHistoryEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|e| {
            e.path == path && specs_sha256.map_or(true, |sha| e.specs_sha256 == sha)
        });
        self.entries = kept;
        removed
    }

    /// Most recent entry for `path`.
    pub fn latest_for(&self, path: &str) -> Option<&PatchHistoryEntry> {
        self.entries
            .iter()
            .filter(|e| e.path == path)
            .max_by_key(|e| e.patched_at)
    }
}

#[derive(Debug, Clone)]
pub struct PatchHistoryStore {
    inner: JsonStore<PatchHistory>,
}

impl PatchHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsonStore::new(path),
        }
    }

    /// Store at `<dir>/patch_history.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(HISTORY_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn load(&self) -> Result<PatchHistory, ConfigError> {
        self.inner.load()
    }

    pub fn is_patched(&self, path: &str, specs_sha256: &str, current_sha256: &str) -> Result<bool, ConfigError> {
        Ok(self.load()?.is_patched(path, specs_sha256, current_sha256))
    }

    pub fn record(&self, entry: PatchHistoryEntry) -> Result<(), ConfigError> {
        self.inner.update(|history| history.upsert(entry))
    }

    pub fn remove(&self, path: &str, specs_sha256: Option<&str>) -> Result<Vec<PatchHistoryEntry>, ConfigError> {
        self.inner.update(|history| history.remove(path, specs_sha256))
    }

    /// The history lock. Patching and restoring a target hold it for the
    /// whole operation, so attempts on one path never interleave.
    pub fn lock(&self) -> Result<FileLock, ConfigError> {
        self.inner.lock()
    }

    pub fn record_locked(&self, held: &FileLock, entry: PatchHistoryEntry) -> Result<(), ConfigError> {
        self.inner.update_locked(held, |history| history.upsert(entry))
    }

    pub fn remove_locked(
        &self,
        held: &FileLock,
        path: &str,
        specs_sha256: Option<&str>,
    ) -> Result<Vec<PatchHistoryEntry>, ConfigError> {
        self.inner.update_locked(held, |history| history.remove(path, specs_sha256))
    }

    pub fn latest_for(&self, path: &str) -> Result<Option<PatchHistoryEntry>, ConfigError> {
        Ok(self.load()?.latest_for(path).cloned())
    }
}
