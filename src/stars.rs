/// Star extraction for registration.
///
/// Works on the 2x2 superpixel luminance of a CFA frame so the mosaic
/// pattern does not break stars apart:
/// - Kappa-Sigma noise estimation for an adaptive threshold
/// - Light Gaussian smoothing before binarization
/// - 8-connected component labelling with size limits
/// - Background-subtracted, flux-weighted centroids
use crate::frame::RasterFrame;
use crate::statistics::{kappa_sigma_noise_estimate, median_in_place};

#[derive(Debug, Clone)]
pub struct StarDetectionParams {
    /// Threshold above background in noise sigmas
    pub detection_sigma: f64,
    pub noise_clipping_multiplier: f64,
    /// Smallest component accepted, in superpixels
    pub min_pixels: usize,
    pub max_pixels: usize,
    /// Keep only this many stars, brightest first
    pub max_stars: usize,
}

impl Default for StarDetectionParams {
    fn default() -> Self {
        Self {
            detection_sigma: 5.0,
            noise_clipping_multiplier: 3.0,
            min_pixels: 3,
            max_pixels: 2500,
            max_stars: 40,
        }
    }
}

/// A detected star in full-resolution mosaic coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Star {
    pub x: f64,
    pub y: f64,
    /// Background-subtracted flux
    pub flux: f64,
    pub peak: f64,
    pub pixel_count: usize,
}

#[derive(Debug, Clone)]
pub struct StarDetectionResult {
    pub stars: Vec<Star>,
    pub noise_sigma: f64,
    pub background: f64,
}

/// Detect the brightest stars of a CFA frame.
pub fn detect_frame_stars(frame: &RasterFrame, params: &StarDetectionParams) -> StarDetectionResult {
    let (luminance, w, h) = frame.superpixel_luminance();
    let mut result = detect_stars(&luminance, w, h, params);
    // Superpixel (i, j) covers mosaic pixels 2i..2i+1, 2j..2j+1
    for star in result.stars.iter_mut() {
        star.x = star.x * 2.0 + 0.5;
        star.y = star.y * 2.0 + 0.5;
    }
    result
}

/// Detect stars in a single-channel image.
pub fn detect_stars(
    data: &[f32],
    width: usize,
    height: usize,
    params: &StarDetectionParams,
) -> StarDetectionResult {
    if width < 3 || height < 3 {
        return StarDetectionResult {
            stars: Vec::new(),
            noise_sigma: 0.0,
            background: 0.0,
        };
    }

    let smoothed = smooth_3x3(data, width, height);
    let noise = kappa_sigma_noise_estimate(&smoothed, params.noise_clipping_multiplier);

    let mut scratch = smoothed.clone();
    let background = median_in_place(&mut scratch).unwrap_or(0.0) as f64;
    let threshold = background + params.detection_sigma * noise.sigma.max(1e-6);

    tracing::debug!(
        "Star detection: background {:.2}, noise {:.3}, threshold {:.2}",
        background,
        noise.sigma,
        threshold
    );

    let mut mask: Vec<bool> = smoothed.iter().map(|&v| v as f64 > threshold).collect();
    let mut stars = Vec::new();
    let mut too_small = 0;
    let mut too_large = 0;
    let mut stack = Vec::new();
    let mut component = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] {
            continue;
        }
        component.clear();
        mask[start] = false;
        stack.push(start);

        while let Some(i) = stack.pop() {
            component.push(i);
            let (x, y) = (i % width, i / width);
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    let nx = x as isize + dx;
                    let ny = y as isize + dy;
                    if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                        continue;
                    }
                    let j = ny as usize * width + nx as usize;
                    if mask[j] {
                        mask[j] = false;
                        stack.push(j);
                    }
                }
            }
        }

        if component.len() < params.min_pixels {
            too_small += 1;
            continue;
        }
        if component.len() > params.max_pixels {
            too_large += 1;
            continue;
        }

        // Touching the border biases the centroid
        if component.iter().any(|&i| {
            let (x, y) = (i % width, i / width);
            x == 0 || y == 0 || x == width - 1 || y == height - 1
        }) {
            continue;
        }

        let mut flux = 0.0;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut peak = f64::MIN;
        for &i in &component {
            let value = (data[i] as f64 - background).max(0.0);
            flux += value;
            sum_x += value * (i % width) as f64;
            sum_y += value * (i / width) as f64;
            peak = peak.max(data[i] as f64);
        }
        if flux <= 0.0 {
            continue;
        }

        stars.push(Star {
            x: sum_x / flux,
            y: sum_y / flux,
            flux,
            peak,
            pixel_count: component.len(),
        });
    }

    stars.sort_by(|a, b| b.flux.total_cmp(&a.flux));
    let found = stars.len();
    stars.truncate(params.max_stars);

    tracing::debug!(
        "Star detection: {} stars ({} kept), {} too small, {} too large",
        found,
        stars.len(),
        too_small,
        too_large
    );

    StarDetectionResult {
        stars,
        noise_sigma: noise.sigma,
        background,
    }
}

/// 3x3 Gaussian (1-2-1) smoothing; border pixels are copied.
fn smooth_3x3(data: &[f32], width: usize, height: usize) -> Vec<f32> {
    const KERNEL: [f32; 3] = [1.0, 2.0, 1.0];
    let mut result = data.to_vec();
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut sum = 0.0;
            for (ky, wy) in KERNEL.iter().enumerate() {
                for (kx, wx) in KERNEL.iter().enumerate() {
                    sum += data[(y + ky - 1) * width + (x + kx - 1)] * wy * wx;
                }
            }
            result[y * width + x] = sum / 16.0;
        }
    }
    result
}
