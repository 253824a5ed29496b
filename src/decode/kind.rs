//! Source file classification by extension

use std::path::Path;

/// Raster formats decoded by the `image` crate
const RASTER_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "gif", "tif", "tiff", "bmp", "webp"];

/// How a source file gets rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Decoded and downsampled by the decode engine
    Raster,
    /// Page 0 rendered by a vector renderer
    Pdf,
    /// Resolution independent, rendered on demand by a vector renderer
    Svg,
    /// Not something the pipeline can display
    Unknown,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = match path.extension() {
            Some(ext) => ext.to_string_lossy().to_lowercase(),
            None => return SourceKind::Unknown,
        };

        if RASTER_EXTENSIONS.contains(&ext.as_str()) {
            SourceKind::Raster
        } else if ext == "pdf" {
            SourceKind::Pdf
        } else if ext == "svg" {
            SourceKind::Svg
        } else {
            SourceKind::Unknown
        }
    }

    /// Vector and paginated kinds skip whole-library preloading
    pub fn is_vector(self) -> bool {
        matches!(self, SourceKind::Pdf | SourceKind::Svg)
    }

    pub fn is_supported(self) -> bool {
        self != SourceKind::Unknown
    }
}
