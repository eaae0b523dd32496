//! Sibling backups of patch targets.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::PatchError;

const BACKUP_INFIX: &str = ".claude-proxy";

/// `<dir>/<basename>.claude-proxy.bak`
pub fn default_backup_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(BACKUP_INFIX);
    name.push(".bak");
    target.with_file_name(name)
}

fn timestamped_backup_path(target: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(format!("{BACKUP_INFIX}.{nanos}.bak"));
    target.with_file_name(name)
}

fn backup_err(path: &Path) -> impl FnOnce(std::io::Error) -> PatchError + '_ {
    move |source| PatchError::BackupIo {
        path: path.to_path_buf(),
        source,
    }
}

/// Copy `original` (the current bytes of `target`) next to it, keeping the
/// target's permissions. Uses the default name unless it is taken.
pub fn create_backup(target: &Path, original: &[u8]) -> Result<PathBuf, PatchError> {
    let mut path = default_backup_path(target);
    if path.exists() {
        path = timestamped_backup_path(target);
    }
    fs::write(&path, original).map_err(backup_err(&path))?;
    let perms = fs::metadata(target)
        .map_err(backup_err(target))?
        .permissions();
    fs::set_permissions(&path, perms).map_err(backup_err(&path))?;
    tracing::debug!(target = "claude_proxy::patch", backup = %path.display(), "backup written");
    Ok(path)
}

/// Write `bytes` over `target` in place (truncating), keeping its mode.
pub fn write_in_place(target: &Path, bytes: &[u8]) -> Result<(), PatchError> {
    let write_err = |source| PatchError::WriteTarget {
        path: target.to_path_buf(),
        source,
    };
    let perms = fs::metadata(target).map_err(write_err)?.permissions();
    fs::write(target, bytes).map_err(write_err)?;
    fs::set_permissions(target, perms).map_err(write_err)?;
    Ok(())
}

/// Put the backup's bytes back over `target`.
pub fn restore_backup(target: &Path, backup: &Path) -> Result<(), PatchError> {
    let original = fs::read(backup).map_err(backup_err(backup))?;
    write_in_place(target, &original)
}

pub fn remove_backup(backup: &Path) {
    if let Err(err) = fs::remove_file(backup) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(target = "claude_proxy::patch", backup = %backup.display(), error = %err, "failed to delete backup");
        }
    }
}
