//! Native code reading on greyscale images.
//!
//! Uses rqrr for a fast QR pass and rxing for every other symbology.

use image::GrayImage;
use rxing::common::HybridBinarizer;
use rxing::{
    BinaryBitmap, DecodeHintType, DecodeHintValue, DecodingHintDictionary, Luma8LuminanceSource,
    MultiFormatReader, Reader,
};
use std::panic::{AssertUnwindSafe, catch_unwind};

/// A code read from an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCode {
    pub text: String,
    /// Symbology name as reported by the decoder (e.g. `QR_CODE`, `UPC_A`).
    pub symbology: String,
}

/// Reads a single optical code from a greyscale image.
///
/// Implementations are stateless per image so a read can be abandoned at any
/// point without cleanup.
pub trait CodeReader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the first code found, or `None` if the image holds no readable code.
    fn read(&self, image: &GrayImage) -> Option<DecodedCode>;
}

/// rqrr + rxing reader used for uploads and live camera frames.
#[derive(Debug, Clone)]
pub struct NativeReader {
    try_harder: bool,
}

impl Default for NativeReader {
    fn default() -> Self {
        Self { try_harder: true }
    }
}

impl NativeReader {
    pub fn new(try_harder: bool) -> Self {
        Self { try_harder }
    }

    fn read_qr(&self, image: &GrayImage) -> Option<DecodedCode> {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(width, height, |x, y| {
            image.get_pixel(x as u32, y as u32).0[0]
        });

        for grid in prepared.detect_grids() {
            match grid.decode() {
                Ok((meta, content)) => {
                    tracing::debug!(
                        "QR decoded: {} bytes, ECC={:?}, version={:?}",
                        content.len(),
                        meta.ecc_level,
                        meta.version
                    );
                    return Some(DecodedCode {
                        text: content,
                        symbology: "QR_CODE".to_string(),
                    });
                }
                Err(e) => {
                    tracing::debug!("QR grid found but decode failed: {:?}", e);
                }
            }
        }
        None
    }

    fn read_multi(&self, image: &GrayImage) -> Option<DecodedCode> {
        let source =
            Luma8LuminanceSource::new(image.as_raw().clone(), image.width(), image.height());
        let mut bitmap = BinaryBitmap::new(HybridBinarizer::new(source));
        let mut reader = MultiFormatReader::default();

        let mut hints: DecodingHintDictionary = DecodingHintDictionary::new();
        if self.try_harder {
            hints.insert(DecodeHintType::TRY_HARDER, DecodeHintValue::TryHarder(true));
        }

        match reader.decode_with_hints(&mut bitmap, &hints) {
            Ok(result) => Some(DecodedCode {
                text: result.getText().to_string(),
                symbology: format!("{:?}", result.getBarcodeFormat()),
            }),
            Err(e) => {
                tracing::trace!("rxing found no code: {:?}", e);
                None
            }
        }
    }
}

impl CodeReader for NativeReader {
    fn name(&self) -> &'static str {
        "native"
    }

    fn read(&self, image: &GrayImage) -> Option<DecodedCode> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        if let Some(code) = self.read_qr(image) {
            return Some(code);
        }
        // rxing can panic on degenerate inputs; treat that as "nothing found".
        catch_unwind(AssertUnwindSafe(|| self.read_multi(image))).unwrap_or_else(|_| {
            tracing::warn!("rxing panicked while reading a {}x{} image", image.width(), image.height());
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{render_qr, render_upc_a};
    use image::Luma;

    #[test]
    fn test_reads_rendered_qr() {
        let reader = NativeReader::default();
        let code = reader.read(&render_qr("SKU-0042", 6).unwrap()).unwrap();
        assert_eq!(code.text, "SKU-0042");
        assert_eq!(code.symbology, "QR_CODE");
    }

    #[test]
    fn test_reads_upright_upc_a_without_try_harder() {
        let reader = NativeReader::new(false);
        let code = reader.read(&render_upc_a("012345678905", 3, 120).unwrap()).unwrap();
        assert_eq!(code.text, "012345678905");
        assert_eq!(code.symbology, "UPC_A");
    }

    #[test]
    fn test_blank_image_has_no_code() {
        let reader = NativeReader::default();
        assert!(reader.read(&GrayImage::from_pixel(200, 200, Luma([255]))).is_none());
    }

    #[test]
    fn test_empty_image_has_no_code() {
        let reader = NativeReader::default();
        assert!(reader.read(&GrayImage::new(0, 0)).is_none());
    }
}
