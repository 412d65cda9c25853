//! Frame type and pixel conversion: YUYV/GREY/Y16 to RGB, dark detection
//! and still-image decoding.

use chrono::{DateTime, Utc};
use image::{ImageError, RgbImage};
use thiserror::Error;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// A captured or uploaded color frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// A frame taken just now.
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self::captured(image, sequence, Utc::now())
    }

    pub fn captured(image: RgbImage, sequence: u32, captured_at: DateTime<Utc>) -> Self {
        let is_dark = is_dark_frame(&image, DARK_FRAME_THRESHOLD);
        Self {
            image,
            captured_at,
            sequence,
            is_dark,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image decode: {0}")]
    Decode(#[from] ImageError),
}

/// Decode an uploaded still (JPEG, PNG, ...) into a frame.
pub fn decode_still(bytes: &[u8]) -> Result<Frame, FrameError> {
    let image = image::load_from_memory(bytes)?.to_rgb8();
    Ok(Frame::new(image, 0))
}

/// Convert packed YUYV (4:2:2) to RGB with BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Expand 8-bit grayscale to RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    if gray.len() < pixels {
        return Err(FrameError::InvalidLength {
            expected: pixels,
            actual: gray.len(),
        });
    }
    let rgb = gray[..pixels].iter().flat_map(|&p| [p, p, p]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: pixels,
        actual: gray.len(),
    })
}

/// Downscale 16-bit little-endian grayscale to 8 bits and expand to RGB.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    if buf.len() < pixels * 2 {
        return Err(FrameError::InvalidLength {
            expected: pixels * 2,
            actual: buf.len(),
        });
    }
    let gray: Vec<u8> = buf[..pixels * 2]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .collect();
    grey_to_rgb(&gray, width, height)
}

/// True if more than `threshold_pct` of pixels have luma in the darkest
/// eighth (0–31).
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = image.width() as usize * image.height() as usize;
    if total == 0 {
        return true;
    }
    let dark = image
        .pixels()
        .filter(|p| {
            let [r, g, b] = p.0;
            // Integer BT.601 luma.
            ((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) < 32
        })
        .count();
    (dark as f32 / total as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Cursor;

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128] is pure gray.
        let rgb = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([100, 100, 100]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_yuyv_to_rgb_red_bias() {
        let rgb = yuyv_to_rgb(&[128, 128, 128, 255], 2, 1).unwrap();
        let [r, g, b] = rgb.get_pixel(0, 0).0;
        assert_eq!(r, 255);
        assert!(g < 128);
        assert_eq!(b, 128);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let rgb = y16_to_rgb(&[0xff, 0x80, 0x00, 0x10], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([0x80, 0x80, 0x80]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([0x10, 0x10, 0x10]));
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&RgbImage::new(10, 10), 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        assert!(!is_dark_frame(&RgbImage::from_pixel(10, 10, Rgb([128, 128, 128])), 0.95));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&RgbImage::new(0, 0), 0.95));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        // 94% dark, 6% bright → not dark
        let img = RgbImage::from_fn(100, 10, |x, _| {
            if x < 94 { Rgb([10, 10, 10]) } else { Rgb([128, 128, 128]) }
        });
        assert!(!is_dark_frame(&img, 0.95));
    }

    #[test]
    fn test_decode_still_png() {
        let src = RgbImage::from_pixel(8, 6, Rgb([200, 100, 50]));
        let mut png = Cursor::new(Vec::new());
        src.write_to(&mut png, image::ImageFormat::Png).unwrap();

        let frame = decode_still(png.get_ref()).unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 6));
        assert_eq!(frame.image.get_pixel(3, 3), &Rgb([200, 100, 50]));
        assert!(!frame.is_dark);
    }

    #[test]
    fn test_decode_still_rejects_garbage() {
        assert!(matches!(decode_still(b"not an image"), Err(FrameError::Decode(_))));
    }
}
