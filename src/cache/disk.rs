//! Disk mirror for decoded images
//!
//! One PNG per cache key under `<cache root>/<tier>/`. The filename is the
//! key's digest, recomputed on every access, so no index file is kept.
//! Persistence is best-effort: write failures are logged and swallowed.

use super::key::CacheKey;
use crate::decode::DecodedImage;
use image::ImageFormat;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

/// Default root for all disk mirrors.
///
/// `~/.cache/preview-cache` on Linux, the platform cache dir elsewhere, falling
/// back to the home directory and finally the temp directory.
pub fn default_cache_root() -> PathBuf {
    let mut path = dirs::cache_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir);
    path.push("preview-cache");
    path
}

/// Per-tier directory of mirrored images
#[derive(Debug, Clone)]
pub struct DiskMirror {
    root: PathBuf,
}

impl DiskMirror {
    /// Open a mirror rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if let Err(e) = fs::create_dir_all(&root) {
            warn!(?root, error = %e, "failed to create disk mirror directory");
        }
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the entry for `key` lives (whether or not it exists)
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.disk_filename())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Load a mirrored image along with the time it was written.
    ///
    /// Unreadable or corrupt mirror files are deleted and reported as a miss.
    pub fn load(&self, key: &CacheKey) -> Option<(DecodedImage, SystemTime)> {
        let path = self.path_for(key);
        let written = fs::metadata(&path).and_then(|m| m.modified()).ok()?;

        match image::open(&path) {
            Ok(img) => {
                trace!(?path, "disk mirror hit");
                Some((DecodedImage::new(img.into_rgba8()), written))
            }
            Err(e) => {
                warn!(?path, error = %e, "discarding unreadable disk mirror entry");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Write an entry. Errors are logged, never returned.
    pub fn store(&self, key: &CacheKey, image: &DecodedImage) {
        let path = self.path_for(key);
        let tmp = path.with_extension("png.tmp");

        if let Err(e) = fs::create_dir_all(&self.root) {
            warn!(root = ?self.root, error = %e, "disk mirror unavailable");
            return;
        }

        let written = image
            .pixels()
            .save_with_format(&tmp, ImageFormat::Png)
            .map_err(|e| e.to_string())
            .and_then(|_| fs::rename(&tmp, &path).map_err(|e| e.to_string()));

        match written {
            Ok(()) => trace!(?path, "wrote disk mirror entry"),
            Err(e) => {
                warn!(?path, error = %e, "failed to write disk mirror entry");
                let _ = fs::remove_file(&tmp);
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        fs::remove_file(self.path_for(key)).is_ok()
    }

    /// Delete every mirrored entry. Returns how many files were removed.
    pub fn clear(&self) -> std::io::Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_entry = path
                .extension()
                .map_or(false, |ext| ext == "png" || ext == "tmp");
            if path.is_file() && is_entry && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        debug!(root = ?self.root, removed, "cleared disk mirror");
        Ok(removed)
    }

    /// Number of mirrored entries on disk
    pub fn entry_count(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().map_or(false, |ext| ext == "png"))
                    .count()
            })
            .unwrap_or(0)
    }
}
