//! Synthetic code images for tests.
//!
//! Enabled for this crate's own tests and, through the `fixtures` feature, for
//! the other workspace crates' dev builds.

use image::{GrayImage, Luma};
use qrcode::types::QrError;
use qrcode::{Color, QrCode};

/// Render `payload` as a QR code with a 4-module quiet zone.
pub fn render_qr(payload: &str, scale: u32) -> Result<GrayImage, QrError> {
    let code = QrCode::new(payload.as_bytes())?;
    let modules = code.width() as u32;
    let colors = code.to_colors();
    let quiet = 4;
    let side = (modules + 2 * quiet) * scale;
    Ok(GrayImage::from_fn(side, side, |x, y| {
        let mx = (x / scale) as i64 - quiet as i64;
        let my = (y / scale) as i64 - quiet as i64;
        if mx < 0 || my < 0 || mx >= modules as i64 || my >= modules as i64 {
            return Luma([255]);
        }
        match colors[(my as u32 * modules + mx as u32) as usize] {
            Color::Dark => Luma([0]),
            Color::Light => Luma([255]),
        }
    }))
}

/// Odd-parity (left half) digit patterns; the right half uses their complement.
const L_CODES: [&str; 10] = [
    "0001101", "0011001", "0010011", "0111101", "0100011", "0110001", "0101111", "0111011",
    "0110111", "0001011",
];

/// Render a 12-digit UPC-A symbol, bars running vertically, with a 12-module
/// quiet zone. `None` unless `digits` is exactly twelve ASCII digits.
pub fn render_upc_a(digits: &str, scale: u32, height: u32) -> Option<GrayImage> {
    if digits.len() != 12 {
        return None;
    }
    let mut modules = String::from("101");
    for (i, c) in digits.chars().enumerate() {
        let d = c.to_digit(10)? as usize;
        if i == 6 {
            modules.push_str("01010");
        }
        if i < 6 {
            modules.push_str(L_CODES[d]);
        } else {
            modules.extend(L_CODES[d].chars().map(|b| if b == '0' { '1' } else { '0' }));
        }
    }
    modules.push_str("101");

    let quiet = 12;
    let bits: Vec<bool> = modules.chars().map(|b| b == '1').collect();
    let width = (bits.len() as u32 + 2 * quiet) * scale;
    Some(GrayImage::from_fn(width, height, |x, _| {
        let m = (x / scale) as i64 - quiet as i64;
        if m >= 0 && (m as usize) < bits.len() && bits[m as usize] {
            Luma([0])
        } else {
            Luma([255])
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upc_a_has_95_modules() {
        let img = render_upc_a("012345678905", 1, 10).unwrap();
        assert_eq!(img.width(), 95 + 24);
        // Start guard begins right after the quiet zone.
        assert_eq!(img.get_pixel(11, 0)[0], 255);
        assert_eq!(img.get_pixel(12, 0)[0], 0);
    }

    #[test]
    fn test_upc_a_rejects_bad_digits() {
        assert!(render_upc_a("01234", 1, 10).is_none());
        assert!(render_upc_a("01234567890X", 1, 10).is_none());
    }
}
