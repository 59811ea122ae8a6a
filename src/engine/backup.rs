//! Online backups and rotation
//!
//! A backup holds the backend lock for the whole disconnect, copy, reconnect
//! sequence, so no write, commit or poll can touch the file mid-copy.
//! Backups live in a `backups/` directory next to the backing file and are
//! named `<stem>-<YYYYmmdd-HHMMSS-ffffff>.<ext>`, which sorts oldest first.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use super::EngineInner;
use crate::error::{Result, VarStoreError};

/// Directory, next to the backing file, that holds backups
pub const BACKUP_DIR: &str = "backups";

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";
const TIMESTAMP_LENGTH: usize = 22;

pub fn backup_dir(file: &Path) -> PathBuf {
    file.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(BACKUP_DIR)
}

fn stem_and_extension(file: &Path) -> (String, Option<String>) {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "variables".to_string());
    let ext = file.extension().map(|e| e.to_string_lossy().into_owned());
    (stem, ext)
}

/// File name of a backup of `file` taken at `at`
pub fn backup_file_name(file: &Path, at: DateTime<Local>) -> String {
    let (stem, ext) = stem_and_extension(file);
    let timestamp = at.format(TIMESTAMP_FORMAT);
    match ext {
        Some(ext) => format!("{}-{}.{}", stem, timestamp, ext),
        None => format!("{}-{}", stem, timestamp),
    }
}

/// Copy `file` into the backup directory
pub fn copy_backup(file: &Path) -> Result<PathBuf> {
    let dir = backup_dir(file);
    std::fs::create_dir_all(&dir)?;
    let target = dir.join(backup_file_name(file, Local::now()));
    std::fs::copy(file, &target)?;
    Ok(target)
}

/// Existing backups of `file`, oldest first
pub fn list_backups(file: &Path) -> Result<Vec<PathBuf>> {
    let dir = backup_dir(file);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let (stem, ext) = stem_and_extension(file);
    let prefix = format!("{}-", stem);
    let suffix = ext.map(|e| format!(".{}", e)).unwrap_or_default();

    let mut backups = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_backup = name.len() == prefix.len() + TIMESTAMP_LENGTH + suffix.len()
            && name.starts_with(&prefix)
            && name.ends_with(&suffix);
        if is_backup && entry.file_type()?.is_file() {
            backups.push(entry.path());
        }
    }

    backups.sort();
    Ok(backups)
}

/// Delete the oldest backups so at most `keep` remain; 0 keeps everything
///
/// Returns the number of deleted backups.
pub fn rotate_backups(file: &Path, keep: usize) -> Result<usize> {
    if keep == 0 {
        return Ok(0);
    }

    let backups = list_backups(file)?;
    let excess = backups.len().saturating_sub(keep);
    for old in &backups[..excess] {
        std::fs::remove_file(old)?;
    }
    Ok(excess)
}

/// Freeze the backend, copy its file, reconnect, then rotate
pub(crate) fn run_backup(inner: &EngineInner) -> Result<PathBuf> {
    let mut backend = inner.backend.lock();
    let file = backend
        .backing_file()
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            VarStoreError::Config(format!("storage '{}' has no backing file to back up", inner.name))
        })?;

    if let Err(e) = backend.disconnect() {
        // Keep the storage usable even though this backup is skipped
        backend.reconnect()?;
        return Err(e);
    }
    let copied = copy_backup(&file);
    let reconnected = backend.reconnect();
    drop(backend);

    let path = copied?;
    reconnected?;

    let removed = rotate_backups(&file, inner.config.backups_to_keep)?;
    if removed > 0 {
        tracing::debug!(storage = %inner.name, "Removed {} old backups", removed);
    }
    Ok(path)
}
