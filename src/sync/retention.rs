//! Retention sweeps for stored records and received archives.

use crate::core::archive::ARCHIVE_EXTENSION;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{error, info};

/// Number of archive artifacts kept on disk by default.
pub const DEFAULT_ARCHIVE_KEEP: usize = 10;

/// Two independent bounds: record age in the store and archive count on
/// disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Delete records with a timestamp strictly before this instant.
    pub store_cutoff: Option<DateTime<Utc>>,
    /// Keep only this many of the most recently modified archives.
    pub archive_keep: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            store_cutoff: None,
            archive_keep: DEFAULT_ARCHIVE_KEEP,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub records_deleted: usize,
    pub archives_deleted: Vec<PathBuf>,
}

/// Delete all but the `keep` most recently modified archives in `dir`.
///
/// Only `*.zip` files are considered. A file that cannot be removed is
/// logged and left in place; the sweep carries on with the rest.
pub fn sweep_archives(dir: &Path, keep: usize) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut archives: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.extension().is_some_and(|ext| ext == ARCHIVE_EXTENSION) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        archives.push((metadata.modified()?, path));
    }

    // Newest first; the name breaks ties so the order is deterministic.
    archives.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    let mut deleted = Vec::new();
    for (_, path) in archives.into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => deleted.push(path),
            Err(err) => error!("archive retention failed for {}: {err}", path.display()),
        }
    }

    if !deleted.is_empty() {
        info!(dir = %dir.display(), deleted = deleted.len(), keep, "swept old archives");
    }
    Ok(deleted)
}

/// Apply both halves of `policy`.
pub fn run_retention(
    store: &Store,
    archive_dir: &Path,
    policy: &RetentionPolicy,
) -> Result<RetentionReport, RetentionError> {
    let records_deleted = match policy.store_cutoff {
        Some(cutoff) => store.delete_before(cutoff)?,
        None => 0,
    };
    let archives_deleted = sweep_archives(archive_dir, policy.archive_keep)?;

    Ok(RetentionReport {
        records_deleted,
        archives_deleted,
    })
}

/// Retention errors.
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("archive sweep failed: {0}")]
    Io(#[from] io::Error),
}
