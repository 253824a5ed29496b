//! Folder enumeration
//!
//! Produces the candidate file list the preloader works through. Callers with
//! their own ordering (collections, search results) can build `SourceFile`s
//! directly instead.

use crate::decode::SourceKind;
use crate::error::LibraryError;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A file the pipeline may be asked to display
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceFile {
    /// Full path to the source
    pub path: PathBuf,
    /// Declared type, which decides how (and whether) it is preloaded
    pub kind: SourceKind,
}

impl SourceFile {
    /// Classify by extension
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = SourceKind::from_path(&path);
        Self { path, kind }
    }

    pub fn with_kind(path: impl Into<PathBuf>, kind: SourceKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

impl From<PathBuf> for SourceFile {
    fn from(path: PathBuf) -> Self {
        SourceFile::new(path)
    }
}

impl From<&Path> for SourceFile {
    fn from(path: &Path) -> Self {
        SourceFile::new(path)
    }
}

/// Recursively list displayable files under `folder`, sorted by path.
///
/// Hidden files and directories are skipped, as are unknown extensions.
/// Unreadable entries are logged and skipped rather than failing the scan.
pub fn scan_folder(folder: &Path) -> Result<Vec<SourceFile>, LibraryError> {
    if !folder.is_dir() {
        return Err(LibraryError::NotADirectory(folder.to_path_buf()));
    }

    debug!(?folder, "scanning folder");

    let mut files = Vec::new();
    let walker = WalkDir::new(folder)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        // Only process files (not directories)
        if !entry.file_type().is_file() {
            continue;
        }

        let file = SourceFile::new(entry.into_path());
        if file.kind.is_supported() {
            files.push(file);
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(?folder, count = files.len(), "scan complete");
    Ok(files)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}
