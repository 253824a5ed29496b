//! Vector source rendering
//!
//! SVGs are parsed with `usvg` and rasterized by `resvg` straight into a pixmap
//! fitted to the size budget, so there is no decode-then-resize step. PDF page
//! rendering needs an external backend and is left to callers that inject
//! their own `VectorRenderer`.

use super::{DecodedImage, SourceKind, VectorRenderer};
use crate::error::DecodeError;
use image::{Rgba, RgbaImage};
use resvg::tiny_skia;
use resvg::usvg::{self, fontdb};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};

/// Renders SVG sources with `resvg`. PDF sources are reported as unsupported.
#[derive(Default)]
pub struct SvgRenderer {
    /// System fonts for `<text>` elements, loaded on first use
    fonts: OnceLock<Arc<fontdb::Database>>,
}

impl SvgRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn fonts(&self) -> Arc<fontdb::Database> {
        self.fonts
            .get_or_init(|| {
                let mut db = fontdb::Database::new();
                db.load_system_fonts();
                debug!(faces = db.len(), "loaded system fonts for SVG text");
                Arc::new(db)
            })
            .clone()
    }

    fn render_svg(&self, path: &Path, max_dimension: u32) -> Result<DecodedImage, DecodeError> {
        let data = std::fs::read(path).map_err(|e| DecodeError::io(path, &e))?;

        let mut options = usvg::Options::default();
        options.resources_dir = path.parent().map(Path::to_path_buf);
        options.fontdb = self.fonts();

        let tree = usvg::Tree::from_data(&data, &options).map_err(|e| DecodeError::Corrupt {
            path: path.to_path_buf(),
            message: format!("failed to parse SVG: {}", e),
        })?;

        let size = tree.size();
        let (width, height) = fit_to_box(size.width(), size.height(), max_dimension).ok_or_else(
            || DecodeError::Corrupt {
                path: path.to_path_buf(),
                message: "SVG has zero width or height".to_string(),
            },
        )?;
        trace!(?path, width, height, "rendering SVG");

        let mut pixmap = tiny_skia::Pixmap::new(width, height).ok_or_else(|| {
            DecodeError::unsupported(path, format!("cannot allocate {}x{} canvas", width, height))
        })?;
        let transform = tiny_skia::Transform::from_scale(
            width as f32 / size.width(),
            height as f32 / size.height(),
        );
        resvg::render(&tree, transform, &mut pixmap.as_mut());

        Ok(DecodedImage::new(pixmap_to_rgba(&pixmap)))
    }
}

impl VectorRenderer for SvgRenderer {
    fn render(
        &self,
        path: &Path,
        kind: SourceKind,
        max_dimension: u32,
    ) -> Result<DecodedImage, DecodeError> {
        match kind {
            SourceKind::Svg => self.render_svg(path, max_dimension),
            SourceKind::Pdf => Err(DecodeError::unsupported(path, "no PDF backend configured")),
            other => Err(DecodeError::unsupported(
                path,
                format!("{:?} is not a vector source", other),
            )),
        }
    }
}

impl std::fmt::Debug for SvgRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvgRenderer")
            .field("fonts_loaded", &self.fonts.get().is_some())
            .finish()
    }
}

/// Canvas size that fits a `width` x `height` document inside a
/// `max_dimension` square. Vectors scale up as well as down.
pub fn fit_to_box(width: f32, height: f32, max_dimension: u32) -> Option<(u32, u32)> {
    if !(width > 0.0 && height > 0.0) || max_dimension == 0 {
        return None;
    }
    let scale = max_dimension as f32 / width.max(height);
    let w = ((width * scale).round() as u32).clamp(1, max_dimension);
    let h = ((height * scale).round() as u32).clamp(1, max_dimension);
    Some((w, h))
}

/// tiny-skia pixmaps are premultiplied; the cache stores straight alpha
fn pixmap_to_rgba(pixmap: &tiny_skia::Pixmap) -> RgbaImage {
    let mut out = RgbaImage::new(pixmap.width(), pixmap.height());
    for (dst, src) in out.pixels_mut().zip(pixmap.pixels()) {
        let c = src.demultiply();
        *dst = Rgba([c.red(), c.green(), c.blue(), c.alpha()]);
    }
    out
}
