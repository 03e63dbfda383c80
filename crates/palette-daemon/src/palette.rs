//! Color extraction from album art.

use palette_proto::protocol::{Rgb, PALETTE_SIZE};
use thiserror::Error;

/// color-thief sampling step; 1 reads every pixel (slowest, most accurate).
pub const PALETTE_QUALITY: u8 = 1;

#[derive(Debug, Error)]
pub enum PaletteError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("quantization failed: {0}")]
    Quantize(String),
    #[error("quantization produced no colors")]
    Empty,
    #[error("unparseable extracted color {0:?}")]
    Color(String),
}

/// Derives an ordered palette from encoded image bytes.  Implementations are
/// CPU-bound and are called from a blocking thread.
pub trait PaletteExtractor: Send + Sync + 'static {
    fn palette(&self, image: &[u8]) -> Result<Vec<Rgb>, PaletteError>;
}

/// Median-cut quantization via the `color-thief` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorThiefExtractor;

impl PaletteExtractor for ColorThiefExtractor {
    fn palette(&self, image: &[u8]) -> Result<Vec<Rgb>, PaletteError> {
        let pixels = image::load_from_memory(image)?.to_rgb8();
        let colors = color_thief::get_palette(
            pixels.as_raw(),
            color_thief::ColorFormat::Rgb,
            PALETTE_QUALITY,
            PALETTE_SIZE as u8,
        )
        .map_err(|e| PaletteError::Quantize(format!("{:?}", e)))?;

        let palette: Vec<Rgb> = colors
            .into_iter()
            .take(PALETTE_SIZE)
            .map(|c| [c.r, c.g, c.b])
            .collect();
        if palette.is_empty() {
            return Err(PaletteError::Empty);
        }
        Ok(palette)
    }
}

/// Reads the "extracted color" string the way the host always has: after
/// trimming `#`, the characters at offsets 1, 3 and 5 are each read as a
/// single hex digit.  `#1A2B3C` → `[10, 11, 12]`.
///
/// This is not a normal `#RRGGBB` decode.  Displayed colors depend on it, so
/// it is kept as-is.
pub fn parse_extracted_color(raw: &str) -> Result<Rgb, PaletteError> {
    let digits = raw.trim_matches('#');
    let mut rgb = [0u8; 3];
    for (slot, offset) in rgb.iter_mut().zip([1usize, 3, 5]) {
        let digit = digits
            .get(offset..offset + 1)
            .ok_or_else(|| PaletteError::Color(raw.to_string()))?;
        *slot = u8::from_str_radix(digit, 16).map_err(|_| PaletteError::Color(raw.to_string()))?;
    }
    Ok(rgb)
}
