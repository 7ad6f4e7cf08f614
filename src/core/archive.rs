//! Single-file bundles of per-sensor logs.
//!
//! Packaging never modifies the source logs. Extraction is confined to the
//! destination directory: every entry name is resolved and checked before
//! any byte is written, so one bad entry rejects the whole archive.

use crate::collector::types::SensorKind;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// File name prefix of every package artifact.
pub const ARCHIVE_PREFIX: &str = "sensordata_";

/// File extension of every package artifact.
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Archive errors.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An entry name resolves outside the extraction directory.
    #[error("path traversal attempt detected in entry '{entry}'")]
    PathTraversal { entry: String },

    /// An entry name that resolves to the extraction directory itself.
    #[error("archive entry '{entry}' has no file name")]
    EmptyEntry { entry: String },
}

/// Builds package archives in a staging directory.
#[derive(Debug, Clone)]
pub struct Archiver {
    staging_dir: PathBuf,
}

impl Archiver {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Bundle the known sensor logs found in `source_dir`.
    ///
    /// Returns `Ok(None)` when `source_dir` does not exist. Each log that is
    /// present becomes one entry named after the log file.
    pub fn create_archive(&self, source_dir: &Path) -> Result<Option<PathBuf>, ArchiveError> {
        if !source_dir.is_dir() {
            return Ok(None);
        }

        fs::create_dir_all(&self.staging_dir)?;
        let (path, file) = create_unique(&self.staging_dir, Utc::now())?;

        match write_entries(file, source_dir) {
            Ok(entries) => {
                info!(archive = %path.display(), entries, "created sensor data archive");
                Ok(Some(path))
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Unpack `archive` into `dest_dir`, returning the paths written.
    ///
    /// Fails with [`ArchiveError::PathTraversal`] if any entry would land
    /// outside `dest_dir`; in that case nothing is written.
    pub fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
        fs::create_dir_all(dest_dir)?;
        let root = dest_dir.canonicalize()?;

        let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;

        let mut targets = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let entry = zip.by_index_raw(index)?;
            let name = entry.name().to_string();
            let target = match confine(&root, &name) {
                Ok(target) => target,
                Err(e) => {
                    error!(archive = %archive.display(), entry = %name, "rejecting archive: {e}");
                    return Err(e);
                }
            };
            targets.push((index, target, entry.is_dir()));
        }

        let mut written = Vec::with_capacity(targets.len());
        for (index, target, is_dir) in targets {
            if is_dir {
                fs::create_dir_all(&target)?;
                ensure_contained(&root, &target, &target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
                ensure_contained(&root, parent, &target)?;
            }

            let mut entry = zip.by_index(index)?;
            let mut out = BufWriter::new(File::create(&target)?);
            io::copy(&mut entry, &mut out)?;
            out.flush()?;
            written.push(target);
        }

        info!(
            archive = %archive.display(),
            files = written.len(),
            "extracted sensor data archive"
        );
        Ok(written)
    }
}

/// `sensordata_<yyyyMMdd_HHmmss_SSS>.zip`
pub fn archive_file_name(at: DateTime<Utc>) -> String {
    format!(
        "{ARCHIVE_PREFIX}{}.{ARCHIVE_EXTENSION}",
        at.format("%Y%m%d_%H%M%S_%3f")
    )
}

/// Create a new archive file, adding a numeric suffix if the timestamped
/// name is taken.
pub(crate) fn create_unique(dir: &Path, at: DateTime<Utc>) -> io::Result<(PathBuf, File)> {
    let base = archive_file_name(at);
    let stem = base.trim_end_matches(&format!(".{ARCHIVE_EXTENSION}")).to_string();

    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{stem}-{attempt}.{ARCHIVE_EXTENSION}")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 1000 => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

fn write_entries(file: File, source_dir: &Path) -> Result<usize, ArchiveError> {
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = 0;
    for kind in SensorKind::ALL {
        let path = source_dir.join(kind.file_name());
        if !path.is_file() {
            continue;
        }
        let mut source = File::open(&path)?;
        zip.start_file(kind.file_name(), options)?;
        io::copy(&mut source, &mut zip)?;
        entries += 1;
    }

    let mut out = zip.finish()?;
    out.flush()?;
    Ok(entries)
}

/// Resolve an entry name against the canonical extraction root.
///
/// Resolution is lexical: `..` may only step back out of directories the
/// entry itself descended into, and absolute names are rejected. The
/// nearest existing ancestor is then canonicalized so a symlink inside the
/// root cannot redirect the write.
fn confine(root: &Path, entry: &str) -> Result<PathBuf, ArchiveError> {
    let traversal = || ArchiveError::PathTraversal {
        entry: entry.to_string(),
    };

    if entry.contains('\0') {
        return Err(traversal());
    }

    let mut target = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(entry).components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(traversal());
                }
                target.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(traversal()),
        }
    }

    if depth == 0 {
        return Err(ArchiveError::EmptyEntry {
            entry: entry.to_string(),
        });
    }

    ensure_contained(root, &target, &target)?;
    Ok(target)
}

/// Check that the nearest existing ancestor of `path` canonicalizes to a
/// location inside `root`.
fn ensure_contained(root: &Path, path: &Path, reported: &Path) -> Result<(), ArchiveError> {
    let mut probe = path;
    loop {
        if probe.exists() {
            let resolved = probe.canonicalize()?;
            if resolved.starts_with(root) {
                return Ok(());
            }
            return Err(ArchiveError::PathTraversal {
                entry: reported.display().to_string(),
            });
        }
        match probe.parent() {
            Some(parent) => probe = parent,
            None => {
                return Err(ArchiveError::PathTraversal {
                    entry: reported.display().to_string(),
                })
            }
        }
    }
}
