//! Pipeline configuration
//!
//! Stored as JSON. Every field has a default, so a config file only needs to
//! mention what it changes.

use crate::cache::disk::{default_cache_root, DiskMirror};
use crate::cache::key::{Tier, PREVIEW_MAX_DIMENSION};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Limits and persistence for one bounded cache
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TierConfig {
    /// Maximum number of resident entries
    pub count_limit: usize,
    /// Target for the summed entry cost, in bytes (soft; see `BoundedCache`)
    pub cost_limit_bytes: u64,
    /// Mirror entries to disk for reuse across launches
    pub disk_mirror: bool,
}

impl TierConfig {
    /// Many small entries, modest byte budget
    pub fn thumbnails() -> Self {
        Self {
            count_limit: 4000,
            cost_limit_bytes: 64 * MIB,
            disk_mirror: true,
        }
    }

    /// Few large entries, multi-GB budget so a typical library stays resident
    pub fn previews() -> Self {
        Self {
            count_limit: 500,
            cost_limit_bytes: 4 * GIB,
            disk_mirror: true,
        }
    }
}

/// Everything needed to build an `ImagePipeline`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub thumbnails: TierConfig,
    pub previews: TierConfig,
    /// Decode workers; `None` uses one per CPU
    pub worker_threads: Option<usize>,
    /// Root of the disk mirrors; `None` uses the platform cache directory
    pub cache_dir: Option<PathBuf>,
    /// Longest side of a decoded preview
    pub preview_max_dimension: u32,
    /// Decode thumbnails at twice their nominal size
    pub high_dpi: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thumbnails: TierConfig::thumbnails(),
            previews: TierConfig::previews(),
            worker_threads: None,
            cache_dir: None,
            preview_max_dimension: PREVIEW_MAX_DIMENSION,
            high_dpi: true,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if given and present, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Memory-only configuration rooted nowhere on disk
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.thumbnails.disk_mirror = false;
        config.previews.disk_mirror = false;
        config
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_root)
    }

    pub fn tier(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Thumbnail => &self.thumbnails,
            Tier::Preview => &self.previews,
        }
    }

    /// Disk mirror for `tier` under the cache root, if that tier persists
    pub fn mirror_for(&self, tier: Tier) -> Option<DiskMirror> {
        self.tier(tier)
            .disk_mirror
            .then(|| DiskMirror::new(self.cache_root().join(tier.dir_name())))
    }

    /// Worker count, at least one
    pub fn worker_count(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get).max(1)
    }
}
