//! Decode/resize engine
//!
//! Turns a source file into a memory-bounded RGBA raster:
//! - Reads the header first to learn the native dimensions
//! - Decodes under allocation limits
//! - Downsamples to the requested budget with the fast thumbnail filter
//!
//! JPEGs are reduced during decoding (see `jpeg.rs`). PDF and SVG sources are
//! handed to a `VectorRenderer`.

pub mod jpeg;
pub mod kind;
pub mod vector;

use crate::error::DecodeError;
use image::{DynamicImage, ImageFormat, ImageReader, Limits, RgbaImage};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub use kind::SourceKind;
pub use vector::SvgRenderer;

/// Decoded rasters are always RGBA8
pub const BYTES_PER_PIXEL: u64 = 4;

/// Upper bound on any single decode allocation (1 GiB)
const DEFAULT_MAX_ALLOC: u64 = 1024 * 1024 * 1024;

/// An immutable decoded image, shared by the cache and every requester
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pixels: RgbaImage,
}

impl DecodedImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Approximate memory footprint: width × height × 4
    pub fn cost(&self) -> u64 {
        self.width() as u64 * self.height() as u64 * BYTES_PER_PIXEL
    }
}

/// Anything that can produce a decoded image for a path and a size budget.
///
/// Implementations are called from worker threads and must be thread-safe.
pub trait Decoder: Send + Sync {
    fn decode(&self, path: &Path, max_dimension: u32) -> Result<DecodedImage, DecodeError>;
}

/// Renders PDF (page 0, fitted to the box) and SVG sources
pub trait VectorRenderer: Send + Sync {
    fn render(
        &self,
        path: &Path,
        kind: SourceKind,
        max_dimension: u32,
    ) -> Result<DecodedImage, DecodeError>;
}

/// Scale that fits `native` inside a `max_dimension` square, never upscaling
pub fn scale_factor(native: (u32, u32), max_dimension: u32) -> f64 {
    let longest = native.0.max(native.1);
    if longest == 0 {
        return 1.0;
    }
    (max_dimension as f64 / longest as f64).min(1.0)
}

/// Output dimensions for `native` under `max_dimension`, at least 1×1
pub fn target_dimensions(native: (u32, u32), max_dimension: u32) -> (u32, u32) {
    let scale = scale_factor(native, max_dimension);
    if scale >= 1.0 {
        return native;
    }
    let width = ((native.0 as f64 * scale).round() as u32).max(1);
    let height = ((native.1 as f64 * scale).round() as u32).max(1);
    (width, height)
}

/// The production decoder: `image` (and scaled JPEG) for rasters, a
/// `VectorRenderer` for SVG and PDF
pub struct DecodeEngine {
    vector: Arc<dyn VectorRenderer>,
    max_alloc: u64,
    scaled_decodes: AtomicU64,
}

impl DecodeEngine {
    pub fn new() -> Self {
        Self::with_vector_renderer(Arc::new(SvgRenderer::new()))
    }

    pub fn with_vector_renderer(vector: Arc<dyn VectorRenderer>) -> Self {
        Self {
            vector,
            max_alloc: DEFAULT_MAX_ALLOC,
            scaled_decodes: AtomicU64::new(0),
        }
    }

    /// Cap on a single decode allocation; larger sources fail as unsupported
    pub fn with_max_alloc(mut self, max_alloc: u64) -> Self {
        self.max_alloc = max_alloc;
        self
    }

    /// JPEGs decoded through the reduced-IDCT path so far
    pub fn scaled_decodes(&self) -> u64 {
        self.scaled_decodes.load(Ordering::Relaxed)
    }

    fn decode_raster(&self, path: &Path, max_dimension: u32) -> Result<DecodedImage, DecodeError> {
        // Step 1: Read only the header to learn the native size
        let header = ImageReader::open(path)
            .map_err(|e| DecodeError::io(path, &e))?
            .with_guessed_format()
            .map_err(|e| DecodeError::io(path, &e))?;
        let format = header.format();
        let native = header
            .into_dimensions()
            .map_err(|e| DecodeError::from_image(path, e))?;

        if native.0 == 0 || native.1 == 0 {
            return Err(DecodeError::Corrupt {
                path: path.to_path_buf(),
                message: "image has zero width or height".to_string(),
            });
        }

        let target = target_dimensions(native, max_dimension);
        trace!(?path, ?native, ?target, ?format, "decoding raster");

        // Step 2: Decode under allocation limits, reduced in one pass when
        // the codec allows it
        let img = match format {
            Some(ImageFormat::Jpeg) if target != native => self
                .decode_jpeg_scaled(path, target)
                .map_or_else(|| self.decode_full(path), Ok)?,
            _ => self.decode_full(path)?,
        };

        // Step 3: Downsample whatever is left over the budget
        let img = if img.width() > target.0 || img.height() > target.1 {
            img.thumbnail(target.0, target.1)
        } else {
            img
        };

        let decoded = DecodedImage::new(img.into_rgba8());
        debug!(
            ?path,
            width = decoded.width(),
            height = decoded.height(),
            "decoded"
        );
        Ok(decoded)
    }

    /// `None` hands the file to the generic decoder, which reports the real error
    fn decode_jpeg_scaled(&self, path: &Path, target: (u32, u32)) -> Option<DynamicImage> {
        match jpeg::decode_scaled(path, target, self.max_alloc) {
            Ok(img) => {
                self.scaled_decodes.fetch_add(1, Ordering::Relaxed);
                Some(DynamicImage::ImageRgba8(img))
            }
            Err(e) => {
                debug!(?path, error = %e, "scaled JPEG decode failed, using full decode");
                None
            }
        }
    }

    fn decode_full(&self, path: &Path) -> Result<DynamicImage, DecodeError> {
        let mut reader = ImageReader::open(path)
            .map_err(|e| DecodeError::io(path, &e))?
            .with_guessed_format()
            .map_err(|e| DecodeError::io(path, &e))?;
        if reader.format().is_none() {
            return Err(DecodeError::unsupported(path, "unrecognized image format"));
        }
        let mut limits = Limits::default();
        limits.max_alloc = Some(self.max_alloc);
        reader.limits(limits);

        reader
            .decode()
            .map_err(|e| DecodeError::from_image(path, e))
    }
}

impl Default for DecodeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DecodeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeEngine")
            .field("max_alloc", &self.max_alloc)
            .field("scaled_decodes", &self.scaled_decodes())
            .finish()
    }
}

impl Decoder for DecodeEngine {
    fn decode(&self, path: &Path, max_dimension: u32) -> Result<DecodedImage, DecodeError> {
        match SourceKind::from_path(path) {
            SourceKind::Raster => self.decode_raster(path, max_dimension),
            kind @ (SourceKind::Pdf | SourceKind::Svg) => {
                self.vector.render(path, kind, max_dimension)
            }
            // Unknown extension: let the content sniffer decide
            SourceKind::Unknown => self.decode_raster(path, max_dimension),
        }
    }
}
