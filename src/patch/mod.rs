//! In-place binary patching of the Claude CLI with backup, history and
//! rollback.
//!
//! A patch attempt walks: ledger check, history check, apply, backup,
//! write, history record and (for the CLI itself) a `--version` probe.
//! Any failure after the write puts the original bytes back.

pub mod backup;
pub mod history;
pub mod policy;
pub mod probe;
pub mod spec;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::config::{ConfigStore, PatchFailure};
use crate::error::PatchError;
use crate::store::{self, FileLock};
use history::{PatchHistoryEntry, PatchHistoryStore};
use spec::{PatchStats, SpecSet};

/// Printed by a bytecode-embedded CLI whose payload was modified.
pub const LAUNCH_FAILURE_MARKER: &str = "error: Module not found '/ @bun @bytecode @b'";

const PRIMARY_NAMES: [&str; 2] = ["claude", "claude.exe"];

/// Tiny hex encoder (avoids adding the `hex` crate).
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(&Sha256::digest(bytes))
}

/// What a patch attempt did to the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// A previous patch of this CLI version failed its probe.
    Skipped { reason: String },
    AlreadyPatched,
    /// No rule changed any byte.
    Unchanged,
    Patched { backup: PathBuf, stats: PatchStats },
    /// The patched CLI failed its probe and the original was restored.
    RolledBack { reason: String },
}

impl PatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PatchOutcome::Skipped { .. } => "skipped",
            PatchOutcome::AlreadyPatched => "already patched",
            PatchOutcome::Unchanged => "unchanged",
            PatchOutcome::Patched { .. } => "patched",
            PatchOutcome::RolledBack { .. } => "rolled back",
        }
    }
}

pub struct PatchEngine {
    proxy_version: String,
    config: ConfigStore,
    history: PatchHistoryStore,
    specs: SpecSet,
    probe_timeout: Duration,
}

impl PatchEngine {
    pub fn new(
        proxy_version: impl Into<String>,
        config: ConfigStore,
        history: PatchHistoryStore,
        specs: SpecSet,
    ) -> Self {
        Self {
            proxy_version: proxy_version.into(),
            config,
            history,
            specs,
            probe_timeout: probe::PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn history(&self) -> &PatchHistoryStore {
        &self.history
    }

    /// Take the history lock off the async worker threads.
    async fn lock_history(&self) -> Result<FileLock, PatchError> {
        let history = self.history.clone();
        store::blocking(move || history.lock())
            .await
            .map_err(PatchError::HistoryIo)
    }

    /// Patch `target` unless the ledger, the history or the rules say
    /// there is nothing to do. The history lock is held from the first
    /// read of the target until the outcome is final.
    pub async fn maybe_patch_executable(&self, target: &Path) -> Result<PatchOutcome, PatchError> {
        let resolved = resolve_target(target)?;
        let primary = is_primary(target) || is_primary(&resolved);
        let key = resolved.to_string_lossy().into_owned();
        let lock = self.lock_history().await?;

        let original = fs::read(&resolved).map_err(|source| PatchError::ReadTarget {
            path: resolved.clone(),
            source,
        })?;
        let current_sha = sha256_hex(&original);

        let cli_version = if primary {
            let probe = probe::probe_version(&resolved, self.probe_timeout).await;
            let version = probe.version();
            let cfg = self.config.load().map_err(PatchError::HistoryIo)?;
            if cfg.has_patch_failure(&self.proxy_version, version.as_deref(), Some(current_sha.as_str())) {
                tracing::info!(
                    target = "claude_proxy::patch",
                    path = %resolved.display(),
                    cli_version = version.as_deref().unwrap_or("unknown"),
                    "skipping patch, this CLI version failed before"
                );
                return Ok(PatchOutcome::Skipped {
                    reason: format!(
                        "patch previously failed for claude {}",
                        version.as_deref().unwrap_or("(unknown version)")
                    ),
                });
            }
            version
        } else {
            None
        };

        let specs_sha = self.specs.sha256();
        if self
            .history
            .is_patched(&key, &specs_sha, &current_sha)
            .map_err(PatchError::HistoryIo)?
        {
            tracing::info!(target = "claude_proxy::patch", path = %resolved.display(), "already patched");
            return Ok(PatchOutcome::AlreadyPatched);
        }

        let (patched, stats) = self.specs.compile()?.apply(&original)?;
        if patched == original {
            tracing::debug!(target = "claude_proxy::patch", path = %resolved.display(), ?stats, "no changes");
            return Ok(PatchOutcome::Unchanged);
        }

        let backup = backup::create_backup(&resolved, &original)?;
        if let Err(err) = backup::write_in_place(&resolved, &patched) {
            self.undo_write(&lock, &resolved, &backup, None);
            return Err(err);
        }

        let entry = PatchHistoryEntry {
            path: key.clone(),
            specs_sha256: specs_sha.clone(),
            patched_sha256: sha256_hex(&patched),
            patched_at: Utc::now(),
            backup_path: Some(backup.to_string_lossy().into_owned()),
        };
        if let Err(err) = self.history.record_locked(&lock, entry) {
            self.undo_write(&lock, &resolved, &backup, None);
            return Err(PatchError::HistoryIo(err));
        }

        // A rewritten binary is rejected by the macOS kernel until re-signed.
        probe::resign_adhoc(&resolved).await;

        if primary {
            let probe = probe::probe_version(&resolved, self.probe_timeout).await;
            if !probe.success {
                let reason = probe.failure_reason();
                tracing::warn!(
                    target = "claude_proxy::patch",
                    path = %resolved.display(),
                    %reason,
                    "patched binary failed its probe, restoring"
                );
                if !self.undo_write(&lock, &resolved, &backup, Some(&specs_sha)) {
                    return Err(PatchError::ProbeFailed {
                        restored: false,
                        reason,
                    });
                }
                self.record_failure(&resolved, cli_version, current_sha, reason.clone())
                    .await?;
                return Ok(PatchOutcome::RolledBack { reason });
            }
        }

        tracing::info!(
            target = "claude_proxy::patch",
            path = %resolved.display(),
            backup = %backup.display(),
            replacements = stats.replacements,
            "patched executable"
        );
        Ok(PatchOutcome::Patched { backup, stats })
    }

    /// Best-effort undo of a write that could not be completed.
    fn undo_write(&self, lock: &FileLock, target: &Path, backup: &Path, specs_sha: Option<&str>) -> bool {
        let restored = match backup::restore_backup(target, backup) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(target = "claude_proxy::patch", path = %target.display(), error = %err, "failed to restore backup");
                false
            }
        };
        if let Some(sha) = specs_sha {
            if let Err(err) = self.history.remove_locked(lock, &target.to_string_lossy(), Some(sha)) {
                tracing::warn!(target = "claude_proxy::patch", error = %err, "failed to drop history entry");
            }
        }
        if restored {
            backup::remove_backup(backup);
        }
        restored
    }

    /// Add a ledger entry so later attempts on this CLI build are skipped.
    async fn record_failure(
        &self,
        target: &Path,
        cli_version: Option<String>,
        original_sha: String,
        reason: String,
    ) -> Result<(), PatchError> {
        let failure = PatchFailure {
            proxy_version: self.proxy_version.clone(),
            claude_version: cli_version,
            claude_path: target.to_string_lossy().into_owned(),
            claude_sha256: Some(original_sha),
            failed_at: Utc::now(),
            reason,
        };
        let config = self.config.clone();
        store::blocking(move || config.update(|cfg| cfg.upsert_patch_failure(failure)))
            .await
            .map_err(PatchError::HistoryIo)
    }

    /// Whether `target`'s current bytes are what this rule set produced.
    pub fn is_patched(&self, target: &Path) -> Result<bool, PatchError> {
        let resolved = resolve_target(target)?;
        let bytes = fs::read(&resolved).map_err(|source| PatchError::ReadTarget {
            path: resolved.clone(),
            source,
        })?;
        self.history
            .is_patched(&resolved.to_string_lossy(), &self.specs.sha256(), &sha256_hex(&bytes))
            .map_err(PatchError::HistoryIo)
    }

    /// Put the recorded backup back over `target`, drop its history and
    /// delete the backup. Returns the backup used, or `None` when there
    /// was nothing to restore.
    pub async fn restore(&self, target: &Path) -> Result<Option<PathBuf>, PatchError> {
        let resolved = resolve_target(target)?;
        let lock = self.lock_history().await?;
        self.restore_locked(&lock, &resolved)
    }

    fn restore_locked(&self, lock: &FileLock, resolved: &Path) -> Result<Option<PathBuf>, PatchError> {
        let key = resolved.to_string_lossy().into_owned();
        let recorded = self
            .history
            .latest_for(&key)
            .map_err(PatchError::HistoryIo)?
            .and_then(|entry| entry.backup_path)
            .map(PathBuf::from);
        let backup = recorded.unwrap_or_else(|| backup::default_backup_path(resolved));
        if !backup.exists() {
            tracing::debug!(target = "claude_proxy::patch", path = %resolved.display(), "no backup to restore");
            return Ok(None);
        }
        backup::restore_backup(resolved, &backup)?;
        self.history
            .remove_locked(lock, &key, None)
            .map_err(PatchError::HistoryIo)?;
        backup::remove_backup(&backup);
        tracing::info!(target = "claude_proxy::patch", path = %resolved.display(), "restored original executable");
        Ok(Some(backup))
    }

    /// After a patched CLI died at launch: re-probe it and, when the known
    /// bad-bytecode marker shows up, restore the original and add a ledger
    /// entry so the next launch does not patch this build again. Returns
    /// whether a restore happened.
    pub async fn recover_from_launch_failure(&self, target: &Path) -> Result<bool, PatchError> {
        let resolved = resolve_target(target)?;
        let lock = self.lock_history().await?;
        if !self.is_patched(&resolved)? {
            return Ok(false);
        }
        let probe = probe::probe_version(&resolved, self.probe_timeout).await;
        if !probe.output.contains(LAUNCH_FAILURE_MARKER) {
            return Ok(false);
        }
        tracing::warn!(
            target = "claude_proxy::patch",
            path = %resolved.display(),
            "patched CLI cannot load its bytecode, restoring original"
        );
        if self.restore_locked(&lock, &resolved)?.is_none() {
            return Ok(false);
        }

        let original = fs::read(&resolved).map_err(|source| PatchError::ReadTarget {
            path: resolved.clone(),
            source,
        })?;
        let cli_version = probe::probe_version(&resolved, self.probe_timeout)
            .await
            .version();
        self.record_failure(&resolved, cli_version, sha256_hex(&original), probe.failure_reason())
            .await?;
        Ok(true)
    }
}

fn resolve_target(target: &Path) -> Result<PathBuf, PatchError> {
    fs::canonicalize(target).map_err(|source| PatchError::StatTarget {
        path: target.to_path_buf(),
        source,
    })
}

fn is_primary(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|name| PRIMARY_NAMES.contains(&name.as_str()))
}
