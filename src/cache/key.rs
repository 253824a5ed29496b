//! Cache keys and size classes

use clap::ValueEnum;
use std::path::{Component, Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

/// Longest side of a decoded preview, in pixels
pub const PREVIEW_MAX_DIMENSION: u32 = 2000;

/// Bump when decode or mirror encoding semantics change
const KEY_VERSION: u8 = 1;

/// A discrete decode resolution.
///
/// Thumbnail classes follow the on-screen cell size; the preview class is a
/// single tier independent of how large the preview is displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum)]
pub enum SizeClass {
    /// 40px list rows
    List,
    /// 80px grid cells
    GridSmall,
    /// 120px grid cells
    GridMedium,
    /// 180px grid cells
    GridLarge,
    /// Full preview, capped at the configured maximum dimension
    Preview,
}

/// Which bounded cache a size class lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Thumbnail,
    Preview,
}

impl SizeClass {
    pub const ALL: [SizeClass; 5] = [
        SizeClass::List,
        SizeClass::GridSmall,
        SizeClass::GridMedium,
        SizeClass::GridLarge,
        SizeClass::Preview,
    ];

    /// Nominal edge length in logical pixels
    pub fn base_dimension(self) -> u32 {
        match self {
            SizeClass::List => 40,
            SizeClass::GridSmall => 80,
            SizeClass::GridMedium => 120,
            SizeClass::GridLarge => 180,
            SizeClass::Preview => PREVIEW_MAX_DIMENSION,
        }
    }

    /// Decode budget for this class. Thumbnails double on high-DPI displays;
    /// previews always use `preview_max`.
    pub fn max_dimension(self, high_dpi: bool, preview_max: u32) -> u32 {
        match self {
            SizeClass::Preview => preview_max,
            thumb if high_dpi => thumb.base_dimension() * 2,
            thumb => thumb.base_dimension(),
        }
    }

    pub fn tier(self) -> Tier {
        match self {
            SizeClass::Preview => Tier::Preview,
            _ => Tier::Thumbnail,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SizeClass::List => "list",
            SizeClass::GridSmall => "grid-small",
            SizeClass::GridMedium => "grid-medium",
            SizeClass::GridLarge => "grid-large",
            SizeClass::Preview => "preview",
        }
    }
}

impl Tier {
    /// Subdirectory of the cache root holding this tier's disk mirror
    pub fn dir_name(self) -> &'static str {
        match self {
            Tier::Thumbnail => "thumbnails",
            Tier::Preview => "previews",
        }
    }
}

/// Identifies one decoded rendition of one source file.
///
/// The content half is a hash of the full normalized path, so two files with
/// the same name in different folders never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    content: u64,
    size: SizeClass,
}

impl CacheKey {
    pub fn new(path: &Path, size: SizeClass) -> Self {
        let normalized = normalize_path(path);
        Self {
            content: xxh3_64(normalized.to_string_lossy().as_bytes()),
            size,
        }
    }

    pub fn content_id(&self) -> u64 {
        self.content
    }

    pub fn size_class(&self) -> SizeClass {
        self.size
    }

    /// Same source, different size class
    pub fn with_size(&self, size: SizeClass) -> Self {
        Self {
            content: self.content,
            size,
        }
    }

    /// Hash of the whole key, used for the disk mirror filename
    pub fn digest(&self) -> u64 {
        let mut data = Vec::with_capacity(10);
        data.push(KEY_VERSION);
        data.extend_from_slice(&self.content.to_le_bytes());
        data.push(self.size as u8);
        xxh3_64(&data)
    }

    pub fn disk_filename(&self) -> String {
        format!("{:016x}.png", self.digest())
    }
}

/// Make a path absolute and lexically clean it (drop `.`, fold `..`).
///
/// Nothing is resolved against the filesystem, so this stays cheap enough for
/// the synchronous lookup path. Symlinked aliases of one file get distinct keys.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Never pop past the root
                if !matches!(
                    normalized.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    normalized.pop();
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_different_folders() {
        let a = CacheKey::new(Path::new("/photos/2023/IMG_0001.jpg"), SizeClass::GridMedium);
        let b = CacheKey::new(Path::new("/photos/2024/IMG_0001.jpg"), SizeClass::GridMedium);
        assert_ne!(a, b);
        assert_ne!(a.disk_filename(), b.disk_filename());
    }

    #[test]
    fn test_size_class_partitions_keys() {
        let path = Path::new("/photos/IMG_0001.jpg");
        let thumb = CacheKey::new(path, SizeClass::GridSmall);
        let preview = CacheKey::new(path, SizeClass::Preview);

        assert_eq!(thumb.content_id(), preview.content_id());
        assert_ne!(thumb, preview);
        assert_ne!(thumb.digest(), preview.digest());
        assert_eq!(thumb.with_size(SizeClass::Preview), preview);
    }

    #[test]
    fn test_equivalent_spellings_share_a_key() {
        let a = CacheKey::new(Path::new("/photos/./2023/../2023/IMG_0001.jpg"), SizeClass::List);
        let b = CacheKey::new(Path::new("/photos/2023/IMG_0001.jpg"), SizeClass::List);
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize_path(Path::new("/../a")), PathBuf::from("/a"));
        assert!(normalize_path(Path::new("relative.jpg")).is_absolute());
    }

    #[test]
    fn test_max_dimension() {
        assert_eq!(SizeClass::List.max_dimension(false, 2000), 40);
        assert_eq!(SizeClass::GridLarge.max_dimension(true, 2000), 360);
        assert_eq!(SizeClass::Preview.max_dimension(true, 1600), 1600);
        assert_eq!(SizeClass::Preview.tier(), Tier::Preview);
        assert_eq!(SizeClass::GridSmall.tier(), Tier::Thumbnail);
    }

    #[test]
    fn test_cli_names_match_labels() {
        for size in SizeClass::ALL {
            let name = size.to_possible_value().unwrap();
            assert_eq!(name.get_name(), size.as_str());
            assert_eq!(SizeClass::from_str(size.as_str(), false), Ok(size));
        }
    }
}
