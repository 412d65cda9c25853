//! Local Binary Patterns Histograms (LBPH) face model.
//!
//! Each absorbed sample is reduced to a spatial histogram of extended LBP
//! codes (circular neighbourhood, bilinear sampling). Prediction is nearest
//! neighbour under the alternative chi-square distance.

use crate::types::SubjectId;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const LBP_EPSILON: f64 = 1e-6;
/// Upper bound on `neighbors`. Each cell has `2^neighbors` bins.
pub const MAX_NEIGHBORS: u32 = 16;
pub const MAX_RADIUS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    /// Length of one spatial histogram under these parameters.
    pub fn histogram_len(&self) -> usize {
        self.grid_x as usize * self.grid_y as usize * self.bins()
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_RADIUS).contains(&self.radius) {
            return Err(format!("radius {} outside 1..={MAX_RADIUS}", self.radius));
        }
        if !(1..=MAX_NEIGHBORS).contains(&self.neighbors) {
            return Err(format!("neighbors {} outside 1..={MAX_NEIGHBORS}", self.neighbors));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(format!("empty grid {}x{}", self.grid_x, self.grid_y));
        }
        Ok(())
    }
}

/// Labelled spatial histograms for every sample absorbed so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbphModel {
    params: LbphParams,
    histograms: Vec<Vec<f32>>,
    labels: Vec<SubjectId>,
}

impl LbphModel {
    pub fn new(params: LbphParams) -> Self {
        Self {
            params,
            histograms: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn params(&self) -> LbphParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[SubjectId] {
        &self.labels
    }

    /// Check a model that came from outside the process before using it.
    pub fn validate(&self) -> Result<(), String> {
        self.params.validate()?;
        if self.histograms.len() != self.labels.len() {
            return Err(format!(
                "{} histograms for {} labels",
                self.histograms.len(),
                self.labels.len()
            ));
        }
        let expected = self.params.histogram_len();
        if let Some((i, h)) = self.histograms.iter().enumerate().find(|(_, h)| h.len() != expected) {
            return Err(format!("histogram {i} has {} bins, expected {expected}", h.len()));
        }
        Ok(())
    }

    /// Absorb one sample under `label`.
    pub fn add(&mut self, image: &GrayImage, label: SubjectId) {
        let hist = self.histogram(image);
        self.histograms.push(hist);
        self.labels.push(label);
    }

    /// Nearest stored sample to `image`, as `(label, distance)`.
    pub fn nearest(&self, image: &GrayImage) -> Option<(SubjectId, f64)> {
        let query = self.histogram(image);
        let mut best: Option<(SubjectId, f64)> = None;
        for (hist, &label) in self.histograms.iter().zip(self.labels.iter()) {
            let dist = chi_square_alt(hist, &query);
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((label, dist));
            }
        }
        best
    }

    fn histogram(&self, image: &GrayImage) -> Vec<f32> {
        let (codes, w, h) = elbp(image, self.params.radius, self.params.neighbors);
        spatial_histogram(&codes, w, h, self.params.bins(), self.params.grid_x, self.params.grid_y)
    }
}

/// Extended (circular) LBP codes.
///
/// Returns the code image and its dimensions, which shrink by `2 * radius`
/// on each axis.
pub fn elbp(image: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, usize, usize) {
    let w = image.width() as usize;
    let h = image.height() as usize;
    let r = radius as usize;
    if w <= 2 * r || h <= 2 * r {
        return (Vec::new(), 0, 0);
    }
    let out_w = w - 2 * r;
    let out_h = h - 2 * r;
    let src = image.as_raw();
    let at = |row: i64, col: i64| src[row as usize * w + col as usize] as f64;

    let mut codes = vec![0u32; out_w * out_h];
    for n in 0..neighbors {
        let angle = 2.0 * PI * n as f64 / neighbors as f64;
        let x = radius as f64 * angle.cos();
        let y = -(radius as f64) * angle.sin();

        let fx = x.floor() as i64;
        let fy = y.floor() as i64;
        let cx = x.ceil() as i64;
        let cy = y.ceil() as i64;
        let tx = x - fx as f64;
        let ty = y - fy as f64;

        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..h - r {
            for j in r..w - r {
                let (ii, jj) = (i as i64, j as i64);
                let t = w1 * at(ii + fy, jj + fx)
                    + w2 * at(ii + fy, jj + cx)
                    + w3 * at(ii + cy, jj + fx)
                    + w4 * at(ii + cy, jj + cx);
                let center = at(ii, jj);
                if t > center || (t - center).abs() < LBP_EPSILON {
                    codes[(i - r) * out_w + (j - r)] |= 1 << n;
                }
            }
        }
    }

    (codes, out_w, out_h)
}

/// Concatenated per-cell histograms over a `grid_x` × `grid_y` grid, each
/// normalized by the cell's pixel count.
pub fn spatial_histogram(
    codes: &[u32],
    width: usize,
    height: usize,
    bins: usize,
    grid_x: u32,
    grid_y: u32,
) -> Vec<f32> {
    let gx = grid_x as usize;
    let gy = grid_y as usize;
    let mut out = vec![0f32; gx * gy * bins];
    let cell_w = if gx > 0 { width / gx } else { 0 };
    let cell_h = if gy > 0 { height / gy } else { 0 };
    if cell_w == 0 || cell_h == 0 {
        return out;
    }
    let cell_pixels = (cell_w * cell_h) as f32;

    for row in 0..gy {
        for col in 0..gx {
            let cell = &mut out[(row * gx + col) * bins..(row * gx + col + 1) * bins];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    let code = codes[y * width + x] as usize;
                    if code < bins {
                        cell[code] += 1.0;
                    }
                }
            }
            for v in cell.iter_mut() {
                *v /= cell_pixels;
            }
        }
    }

    out
}

/// Alternative chi-square distance: `2 * Σ (a - b)² / (a + b)`.
pub fn chi_square_alt(a: &[f32], b: &[f32]) -> f64 {
    let mut sum = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        let denom = x + y;
        if denom.abs() > f64::EPSILON {
            sum += (x - y) * (x - y) / denom;
        }
    }
    2.0 * sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn stripes(period: u32, vertical: bool) -> GrayImage {
        GrayImage::from_fn(100, 100, |x, y| {
            let k = if vertical { x } else { y };
            Luma([if (k / period) % 2 == 0 { 40 } else { 210 }])
        })
    }

    #[test]
    fn test_validate_params() {
        assert!(LbphParams::default().validate().is_ok());
        let bad = [
            LbphParams { radius: 0, ..Default::default() },
            LbphParams { neighbors: 0, ..Default::default() },
            LbphParams { neighbors: 40, ..Default::default() },
            LbphParams { grid_x: 0, ..Default::default() },
        ];
        for params in bad {
            assert!(params.validate().is_err(), "{params:?}");
        }
    }

    #[test]
    fn test_trained_model_validates() {
        let mut model = LbphModel::new(LbphParams::default());
        model.add(&stripes(4, true), 1);
        model.add(&stripes(4, false), 2);
        assert!(model.validate().is_ok());
        assert_eq!(model.histograms[0].len(), LbphParams::default().histogram_len());

        model.histograms[1].truncate(10);
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_elbp_output_shrinks_by_radius() {
        let img = GrayImage::new(10, 8);
        let (codes, w, h) = elbp(&img, 1, 8);
        assert_eq!((w, h), (8, 6));
        assert_eq!(codes.len(), 48);
    }

    #[test]
    fn test_elbp_flat_image_sets_every_bit() {
        // Equal neighbours count as "not darker", so a flat image maps to 0xFF.
        let img = GrayImage::from_pixel(5, 5, Luma([90]));
        let (codes, _, _) = elbp(&img, 1, 8);
        assert!(codes.iter().all(|&c| c == 0xFF));
    }

    #[test]
    fn test_elbp_local_maximum_is_zero() {
        let mut img = GrayImage::from_pixel(3, 3, Luma([10]));
        img.put_pixel(1, 1, Luma([200]));
        let (codes, w, h) = elbp(&img, 1, 8);
        assert_eq!((w, h), (1, 1));
        assert_eq!(codes[0], 0);
    }

    #[test]
    fn test_spatial_histogram_cells_sum_to_one() {
        let (codes, w, h) = elbp(&stripes(3, true), 1, 8);
        let hist = spatial_histogram(&codes, w, h, 256, 8, 8);
        assert_eq!(hist.len(), 64 * 256);
        for cell in hist.chunks(256) {
            let total: f32 = cell.iter().sum();
            assert!((total - 1.0).abs() < 1e-4, "cell sum {total}");
        }
    }

    #[test]
    fn test_chi_square_identical_is_zero() {
        let a = vec![0.25f32, 0.25, 0.5, 0.0];
        assert_eq!(chi_square_alt(&a, &a), 0.0);
    }

    #[test]
    fn test_chi_square_disjoint() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        // 2 * (1/1 + 1/1)
        assert!((chi_square_alt(&a, &b) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_nearest_picks_matching_label() {
        let mut model = LbphModel::new(LbphParams::default());
        model.add(&stripes(4, true), 1);
        model.add(&stripes(4, false), 2);

        let (label, dist) = model.nearest(&stripes(4, false)).unwrap();
        assert_eq!(label, 2);
        assert_eq!(dist, 0.0);

        let (label, _) = model.nearest(&stripes(4, true)).unwrap();
        assert_eq!(label, 1);
    }

    #[test]
    fn test_nearest_on_empty_model() {
        let model = LbphModel::new(LbphParams::default());
        assert!(model.nearest(&stripes(4, true)).is_none());
    }
}
