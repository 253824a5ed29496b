//! Scaled JPEG decoding
//!
//! JPEG can be reduced by 1/2, 1/4 or 1/8 while decoding, by running a smaller
//! IDCT per block. A 100 MP photo needed as a 160px thumbnail then never
//! exists at full size in memory; the final `thumbnail` pass only trims the
//! remaining factor.

use image::{DynamicImage, GrayImage, RgbImage, Rgba, RgbaImage};
use jpeg_decoder::{Decoder, PixelFormat};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::trace;

/// Decode `path` at the smallest DCT scale that still covers `target`.
///
/// The result is at least `target` in both dimensions (or native size if
/// that is smaller). Errors are returned as-is so the caller can fall back to
/// the generic decoder.
pub fn decode_scaled(
    path: &Path,
    target: (u32, u32),
    max_alloc: u64,
) -> Result<RgbaImage, jpeg_decoder::Error> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file));
    decoder.set_max_decoding_buffer_size(usize::try_from(max_alloc).unwrap_or(usize::MAX));
    decoder.read_info()?;

    let requested = (clamp_u16(target.0), clamp_u16(target.1));
    let (width, height) = decoder.scale(requested.0, requested.1)?;
    let format = decoder
        .info()
        .map(|info| info.pixel_format)
        .ok_or_else(|| jpeg_decoder::Error::Format("missing frame header".to_string()))?;
    trace!(?path, ?target, width, height, ?format, "scaled JPEG decode");

    let data = decoder.decode()?;
    to_rgba(format, width as u32, height as u32, data)
}

fn clamp_u16(value: u32) -> u16 {
    u16::try_from(value.max(1)).unwrap_or(u16::MAX)
}

fn to_rgba(
    format: PixelFormat,
    width: u32,
    height: u32,
    data: Vec<u8>,
) -> Result<RgbaImage, jpeg_decoder::Error> {
    let short = || jpeg_decoder::Error::Format("decoded buffer is too short".to_string());

    match format {
        PixelFormat::RGB24 => {
            let rgb = RgbImage::from_raw(width, height, data).ok_or_else(short)?;
            Ok(DynamicImage::ImageRgb8(rgb).into_rgba8())
        }
        PixelFormat::L8 => {
            let gray = GrayImage::from_raw(width, height, data).ok_or_else(short)?;
            Ok(DynamicImage::ImageLuma8(gray).into_rgba8())
        }
        PixelFormat::CMYK32 => {
            if data.len() < width as usize * height as usize * 4 {
                return Err(short());
            }
            let mut out = RgbaImage::new(width, height);
            for (dst, px) in out.pixels_mut().zip(data.chunks_exact(4)) {
                let k = 255 - u16::from(px[3]);
                let channel = |c: u8| ((255 - u16::from(c)) * k / 255) as u8;
                *dst = Rgba([channel(px[0]), channel(px[1]), channel(px[2]), 255]);
            }
            Ok(out)
        }
        PixelFormat::L16 => Err(jpeg_decoder::Error::Format(
            "16-bit JPEG is left to the generic decoder".to_string(),
        )),
    }
}
