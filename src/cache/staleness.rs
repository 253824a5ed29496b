//! Staleness validation
//!
//! A cached entry remembers the source modification time it was built from.
//! The check only runs on a cache hit, so an unchanged library costs nothing
//! beyond one `stat` per re-requested file.

use std::path::Path;
use std::time::SystemTime;

/// Outcome of comparing a source file against a cached snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Source unchanged since the entry was created
    Fresh,
    /// Source modified after the entry was created
    Stale,
    /// Source can no longer be stat'ed
    Missing,
}

impl Freshness {
    pub fn is_fresh(self) -> bool {
        self == Freshness::Fresh
    }
}

/// Current modification time of a source file
pub fn source_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Stale only when the source is strictly newer than the snapshot
pub fn check(path: &Path, snapshot: SystemTime) -> Freshness {
    match source_modified(path) {
        Some(modified) if modified > snapshot => Freshness::Stale,
        Some(_) => Freshness::Fresh,
        None => Freshness::Missing,
    }
}
