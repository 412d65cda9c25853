//! Face sample normalization: crop, luma, CLAHE, resize to canonical size.
//!
//! The same pipeline feeds enrollment and recognition, so lighting drift between
//! the two sessions is reduced before samples ever reach the classifier.

use crate::types::{BoundingBox, CanonicalFace, CANONICAL_SIZE};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use thiserror::Error;

/// CLAHE tile grid (tiles per side).
pub const CLAHE_TILES: u32 = 8;
/// CLAHE clip limit, as a multiple of the uniform bin height.
pub const CLAHE_CLIP_LIMIT: f32 = 2.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("face box lies outside the {frame_width}x{frame_height} frame")]
    EmptyCrop { frame_width: u32, frame_height: u32 },
}

/// Produce the canonical sample for one detected face.
pub fn normalize(frame: &RgbImage, face: &BoundingBox) -> Result<CanonicalFace, NormalizeError> {
    let (x, y, w, h) = face
        .pixel_rect(frame.width(), frame.height())
        .ok_or(NormalizeError::EmptyCrop {
            frame_width: frame.width(),
            frame_height: frame.height(),
        })?;

    let crop = imageops::crop_imm(frame, x, y, w, h).to_image();
    let mut gray = imageops::grayscale(&crop);
    clahe_enhance(&mut gray, CLAHE_TILES, CLAHE_CLIP_LIMIT);
    let resized = imageops::resize(&gray, CANONICAL_SIZE, CANONICAL_SIZE, FilterType::Triangle);

    Ok(CanonicalFace(resized))
}

/// Color crop of a face, used for the profile image.
pub fn crop_color(frame: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = face.pixel_rect(frame.width(), frame.height())?;
    Some(imageops::crop_imm(frame, x, y, w, h).to_image())
}

/// Apply Contrast-Limited Adaptive Histogram Equalization in place.
///
/// Splits the image into `tiles` × `tiles` regions, clips each region's
/// histogram at `clip_limit` times the mean bin height, redistributes the
/// excess, and maps every pixel by bilinear interpolation between the four
/// nearest tile CDFs. Images too small for the grid are left untouched.
pub fn clahe_enhance(gray: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let w = gray.width() as usize;
    let h = gray.height() as usize;
    let t = tiles as usize;
    if w == 0 || h == 0 || t == 0 {
        return;
    }
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);
    let pixels: &mut [u8] = &mut **gray;

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[pixels[y * w + x] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            let mut cdf = [0f32; 256];
            let mut running = 0f32;
            for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
                running += count as f32;
                *slot = running * 255.0 / tile_pixels as f32;
            }
            cdfs.push(cdf);
        }
    }

    let last = (t - 1) as f32;
    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let p = pixels[y * w + x] as usize;
            let top = cdfs[r0 * t + c0][p] * (1.0 - dx) + cdfs[r0 * t + c1][p] * dx;
            let bot = cdfs[r1 * t + c0][p] * (1.0 - dx) + cdfs[r1 * t + c1][p] * dx;
            let val = top * (1.0 - dy) + bot * dy;

            pixels[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn stddev(data: &[u8]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
        let variance = data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n;
        variance.sqrt()
    }

    fn gradient_frame(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = ((x * 7 + y * 3) % 256) as u8;
            Rgb([v, v / 2, 255 - v])
        })
    }

    #[test]
    fn test_clahe_increases_contrast() {
        let mut gray = GrayImage::from_fn(64, 64, |x, y| image::Luma([100 + ((x + y * 64) % 11) as u8]));
        let before = stddev(gray.as_raw());
        clahe_enhance(&mut gray, 8, CLAHE_CLIP_LIMIT);
        let after = stddev(gray.as_raw());
        assert!(after > before, "CLAHE should increase contrast: {before:.2} -> {after:.2}");
    }

    #[test]
    fn test_clahe_skips_tiny_images() {
        let mut gray = GrayImage::from_pixel(4, 4, image::Luma([77]));
        clahe_enhance(&mut gray, 8, CLAHE_CLIP_LIMIT);
        assert!(gray.pixels().all(|p| p.0[0] == 77));
    }

    #[test]
    fn test_normalize_outputs_canonical_size() {
        let frame = gradient_frame(320, 240);
        let face = BoundingBox { x: 40.0, y: 30.0, width: 123.0, height: 151.0, confidence: 0.9 };
        let sample = normalize(&frame, &face).unwrap();
        assert_eq!(sample.image().dimensions(), (CANONICAL_SIZE, CANONICAL_SIZE));
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let frame = gradient_frame(200, 200);
        let face = BoundingBox { x: 10.0, y: 10.0, width: 90.0, height: 90.0, confidence: 0.9 };
        assert_eq!(normalize(&frame, &face).unwrap(), normalize(&frame, &face).unwrap());
    }

    #[test]
    fn test_normalize_clamps_overhanging_box() {
        let frame = gradient_frame(100, 100);
        let face = BoundingBox { x: 60.0, y: -20.0, width: 80.0, height: 70.0, confidence: 0.9 };
        assert!(normalize(&frame, &face).is_ok());
    }

    #[test]
    fn test_normalize_rejects_box_outside_frame() {
        let frame = gradient_frame(100, 100);
        let face = BoundingBox { x: 150.0, y: 0.0, width: 20.0, height: 20.0, confidence: 0.9 };
        assert_eq!(
            normalize(&frame, &face),
            Err(NormalizeError::EmptyCrop { frame_width: 100, frame_height: 100 })
        );
    }

    #[test]
    fn test_crop_color_matches_box() {
        let frame = gradient_frame(100, 100);
        let face = BoundingBox { x: 10.0, y: 20.0, width: 30.0, height: 40.0, confidence: 0.9 };
        let crop = crop_color(&frame, &face).unwrap();
        assert_eq!(crop.dimensions(), (30, 40));
        assert_eq!(crop.get_pixel(0, 0), frame.get_pixel(10, 20));
    }
}
