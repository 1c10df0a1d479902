//! Deterministic image transforms that make codes easier to read.
//!
//! Every function takes its input by reference and returns a fresh buffer.
//! Nothing here is random or time-dependent, so the same bytes always produce
//! the same variants.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat};
use imageproc::contrast::{ThresholdType, otsu_level, threshold};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::types::Rotation;

/// Preprocessing error type.
#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    /// Input bytes are not a supported image or are corrupt.
    #[error("Unsupported or corrupt image: {0}")]
    Decode(#[source] image::ImageError),
    /// A variant could not be encoded.
    #[error("Failed to encode image variant: {0}")]
    Encode(#[source] image::ImageError),
    /// The image decoded but has no pixels.
    #[error("Image has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
}

/// Tunable preprocessing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Longest edge after resizing. Smaller images are never upscaled.
    pub max_edge: u32,
    /// JPEG quality for the payload sent to the vision service.
    pub jpeg_quality: u8,
    /// Gaussian sigma of the unsharp mask.
    pub sharpen_sigma: f32,
    /// Minimum difference for the unsharp mask to apply.
    pub sharpen_threshold: i32,
    /// Fraction of darkest/brightest pixels clipped by contrast normalization.
    pub clip_fraction: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_edge: 1600,
            jpeg_quality: 85,
            sharpen_sigma: 1.0,
            sharpen_threshold: 2,
            clip_fraction: 0.005,
        }
    }
}

/// Produces decode-friendly variants of an input image.
#[derive(Debug, Clone, Default)]
pub struct ImagePreprocessor {
    config: PreprocessConfig,
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Decode encoded image bytes.
    pub fn load(&self, bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
        let img = image::load_from_memory(bytes).map_err(PreprocessError::Decode)?;
        if img.width() == 0 || img.height() == 0 {
            return Err(PreprocessError::Empty {
                width: img.width(),
                height: img.height(),
            });
        }
        Ok(img)
    }

    /// Bound the longest edge, convert to greyscale, normalize contrast and sharpen.
    pub fn optimize_image(&self, img: &DynamicImage) -> GrayImage {
        let longest = img.width().max(img.height());
        let gray = if longest > self.config.max_edge {
            img.resize(self.config.max_edge, self.config.max_edge, FilterType::Lanczos3)
                .to_luma8()
        } else {
            img.to_luma8()
        };
        let normalized = normalize(&gray, self.config.clip_fraction);
        imageops::unsharpen(
            &normalized,
            self.config.sharpen_sigma,
            self.config.sharpen_threshold,
        )
    }

    /// Rotate clockwise by a quarter-turn multiple, then re-normalize.
    pub fn rotate_image(&self, gray: &GrayImage, rotation: Rotation) -> GrayImage {
        let rotated = match rotation {
            Rotation::Deg90 => imageops::rotate90(gray),
            Rotation::Deg180 => imageops::rotate180(gray),
            Rotation::Deg270 => imageops::rotate270(gray),
        };
        normalize(&rotated, self.config.clip_fraction)
    }

    /// Optimized variant of encoded bytes, as PNG.
    pub fn optimize(&self, bytes: &[u8]) -> Result<Vec<u8>, PreprocessError> {
        let img = self.load(bytes)?;
        encode_png(&self.optimize_image(&img))
    }

    /// Rotated, greyscale, normalized variant of encoded bytes, as PNG.
    pub fn rotate(&self, bytes: &[u8], rotation: Rotation) -> Result<Vec<u8>, PreprocessError> {
        let gray = self.load(bytes)?.to_luma8();
        encode_png(&self.rotate_image(&gray, rotation))
    }

    /// Binarized (Otsu) variant of encoded bytes, as PNG.
    pub fn threshold(&self, bytes: &[u8]) -> Result<Vec<u8>, PreprocessError> {
        let gray = self.load(bytes)?.to_luma8();
        encode_png(&binarize(&gray))
    }

    /// Encode a variant for the vision service.
    pub fn encode_for_transport(&self, gray: &GrayImage) -> Result<Vec<u8>, PreprocessError> {
        let mut buf = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, self.config.jpeg_quality);
        encoder.encode_image(gray).map_err(PreprocessError::Encode)?;
        Ok(buf)
    }
}

/// Lossless encoding used for local scratch variants.
pub fn encode_png(gray: &GrayImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    gray.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(PreprocessError::Encode)?;
    Ok(buf)
}

/// Linear contrast stretch between the clipped darkest and brightest levels.
///
/// Flat images are returned unchanged.
pub fn normalize(gray: &GrayImage, clip_fraction: f32) -> GrayImage {
    let mut histogram = [0u64; 256];
    for p in gray.pixels() {
        histogram[p.0[0] as usize] += 1;
    }

    let total: u64 = histogram.iter().sum();
    let clip = (total as f64 * clip_fraction.clamp(0.0, 0.49) as f64) as u64;

    let mut low = 0usize;
    let mut seen = 0u64;
    for (level, count) in histogram.iter().enumerate() {
        seen += count;
        if seen > clip {
            low = level;
            break;
        }
    }

    let mut high = 255usize;
    seen = 0;
    for (level, count) in histogram.iter().enumerate().rev() {
        seen += count;
        if seen > clip {
            high = level;
            break;
        }
    }

    if high <= low {
        return gray.clone();
    }

    let span = (high - low) as u32;
    let mut lut = [0u8; 256];
    for (level, out) in lut.iter_mut().enumerate() {
        let shifted = level.saturating_sub(low).min(high - low) as u32;
        *out = ((shifted * 255 + span / 2) / span) as u8;
    }

    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p.0[0] = lut[p.0[0] as usize];
    }
    out
}

/// Global Otsu binarization.
pub fn binarize(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    threshold(gray, level, ThresholdType::Binary)
}
