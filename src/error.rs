//! Error taxonomy of a sync attempt.
//!
//! Malformed log lines never appear here: the parser skips them and
//! counts them. Everything else ends the current attempt and is reported
//! through [`SyncStatus::Error`](crate::sync::SyncStatus::Error).

use crate::core::archive::ArchiveError;
use crate::store::StoreError;
use crate::sync::transport::TransportError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no sensor logs to package in {}", .0.display())]
    NothingToSend(PathBuf),

    #[error("sync worker failed: {0}")]
    Task(String),

    #[error("sync attempt aborted before completion")]
    Aborted,
}

impl SyncError {
    /// True when the attempt failed because a package tried to escape its
    /// extraction directory.
    pub fn is_path_traversal(&self) -> bool {
        matches!(self, SyncError::Archive(ArchiveError::PathTraversal { .. }))
    }
}
