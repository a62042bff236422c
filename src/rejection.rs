//! Per-output-pixel outlier rejection for the drizzle accumulation.
//!
//! Every frame is first reduced to one weighted mean per output pixel and CFA
//! plane, so a kernel spreading a frame over several neighbours still counts
//! that frame once. A first drizzle pass only gathers running statistics of
//! those per-frame means. During the second (accumulating) pass each frame's
//! mean is compared with the statistics of all the *other* frames at the same
//! pixel, so a satellite trail in one frame cannot inflate the spread it is
//! judged against.

use crate::config::SigmaThresholds;
use crate::drizzle::{AccumCell, DrizzleGrid, BAND_ROWS};
use crate::frame::RasterFrame;
use crate::registration::GeometricTransform;
use crate::statistics::RunningStat;
use rayon::prelude::*;

/// Relative spread below which all other frames count as identical
const MIN_RELATIVE_SIGMA: f64 = 1e-4;

pub struct SigmaRejector {
    thresholds: SigmaThresholds,
    min_samples: usize,
    width: usize,
    stats: Vec<[RunningStat; 4]>,
    frames: usize,
}

impl SigmaRejector {
    pub fn new(grid: &DrizzleGrid, thresholds: SigmaThresholds, min_samples: usize) -> Self {
        Self {
            thresholds,
            min_samples,
            width: grid.width,
            stats: vec![[RunningStat::default(); 4]; grid.pixel_count()],
            frames: 0,
        }
    }

    pub fn thresholds(&self) -> SigmaThresholds {
        self.thresholds
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// First pass: record this frame's per-pixel means without
    /// accumulating. Returns how many pixel/plane means were recorded.
    pub fn observe(
        &mut self,
        grid: &DrizzleGrid,
        frame: &RasterFrame,
        frame_to_reference: &GeometricTransform,
    ) -> u64 {
        let to_output = grid.output_transform(frame_to_reference);
        let width = self.width;
        let observed = self
            .stats
            .par_chunks_mut(BAND_ROWS * width)
            .enumerate()
            .map(|(band, stats)| {
                let y0 = band * BAND_ROWS;
                let y1 = y0 + stats.len() / width;
                let mut own = vec![AccumCell::default(); stats.len()];
                grid.splat_band(frame, &to_output, y0, y1, &mut own);

                let mut count = 0u64;
                for (stat, own) in stats.iter_mut().zip(&own) {
                    for (plane, stat) in stat.iter_mut().enumerate() {
                        if let Some(value) = own.mean(plane) {
                            stat.push(value);
                            count += 1;
                        }
                    }
                }
                count
            })
            .sum();
        self.frames += 1;
        observed
    }

    /// Whether a frame's mean `value` at output pixel `index` survives.
    #[inline]
    pub fn keep(&self, index: usize, plane: usize, value: f32) -> bool {
        !is_outlier(&self.stats[index][plane], value, self.thresholds, self.min_samples)
    }

    /// Number of frames recorded at an output pixel and plane.
    pub fn samples(&self, index: usize, plane: usize) -> u32 {
        self.stats[index][plane].count
    }
}

/// `value` (already pushed into `stat`) against the statistics of every
/// other frame. Below `min_samples` other frames nothing is an outlier.
pub fn is_outlier(
    stat: &RunningStat,
    value: f32,
    thresholds: SigmaThresholds,
    min_samples: usize,
) -> bool {
    let (others, mean, sigma) = stat.without(value);
    if (others as usize) < min_samples {
        return false;
    }
    let sigma = sigma.max(MIN_RELATIVE_SIGMA * mean.abs().max(1.0));
    let x = value as f64;
    x < mean - thresholds.low * sigma || x > mean + thresholds.high * sigma
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DrizzleKernel, DrizzleParams};
    use crate::drizzle::AccumulationBuffer;
    use crate::frame::CfaPattern;

    fn thresholds() -> SigmaThresholds {
        SigmaThresholds {
            low: 3.0,
            high: 3.0,
        }
    }

    fn stat_of(samples: &[f32]) -> RunningStat {
        let mut stat = RunningStat::default();
        for &s in samples {
            stat.push(s);
        }
        stat
    }

    #[test]
    fn test_outlier_rejected_with_enough_samples() {
        let stat = stat_of(&[100.0, 101.0, 99.0, 100.5, 99.5, 100.0, 5000.0]);
        assert!(is_outlier(&stat, 5000.0, thresholds(), 5));
        assert!(!is_outlier(&stat, 100.5, thresholds(), 5));
    }

    #[test]
    fn test_few_samples_keep_everything() {
        let stat = stat_of(&[100.0, 101.0, 5000.0]);
        assert!(!is_outlier(&stat, 5000.0, thresholds(), 5));
        // Exactly at the limit: four others is still below five
        let stat = stat_of(&[100.0, 101.0, 99.0, 100.0, 5000.0]);
        assert!(!is_outlier(&stat, 5000.0, thresholds(), 5));
    }

    #[test]
    fn test_asymmetric_thresholds() {
        let stat = stat_of(&[10.0, 12.0, 8.0, 11.0, 9.0, 10.0, 10.0, 12.5]);
        let asymmetric = SigmaThresholds {
            low: 3.0,
            high: 1.0,
        };
        assert!(is_outlier(&stat, 12.5, asymmetric, 5));
        assert!(!is_outlier(&stat, 12.5, thresholds(), 5));
    }

    #[test]
    fn test_identical_samples_are_not_rejected() {
        let stat = stat_of(&[42.0; 10]);
        assert!(!is_outlier(&stat, 42.0, thresholds(), 5));
    }

    const SPIKE: (usize, usize) = (8, 8);

    fn grid_for(kernel: DrizzleKernel, w: usize, h: usize) -> DrizzleGrid {
        let params = DrizzleParams {
            kernel,
            scale: 1.0,
            pixfrac: 1.0,
        };
        DrizzleGrid::new(params, w, h)
    }

    fn base(w: usize, h: usize) -> Vec<f32> {
        (0..w * h).map(|i| 200.0 + (i % 7) as f32).collect()
    }

    /// `n` aligned frames with small per-frame offsets; frame 0 carries a
    /// cosmic-ray hit at `SPIKE`.
    fn spiked_frames(n: usize, w: usize, h: usize) -> Vec<RasterFrame> {
        let base = base(w, h);
        let mut frames: Vec<RasterFrame> = (0..n)
            .map(|k| {
                let data = base.iter().map(|v| v + (k % 3) as f32 - 1.0).collect();
                RasterFrame::synthetic(&format!("f{}", k), w, h, data)
            })
            .collect();
        frames[0].data[SPIKE.1 * w + SPIKE.0] += 3000.0;
        frames
    }

    /// Observe then accumulate; returns the rejections of each frame.
    fn stack(grid: &DrizzleGrid, frames: &[RasterFrame]) -> (Vec<u64>, crate::drizzle::FinalizedPlanes) {
        let identity = GeometricTransform::identity();
        let mut rejector = SigmaRejector::new(grid, thresholds(), 5);
        for frame in frames {
            rejector.observe(grid, frame, &identity);
        }
        let mut buffer = AccumulationBuffer::new(grid);
        let rejected = frames
            .iter()
            .map(|frame| buffer.accumulate(grid, frame, &identity, Some(&rejector)).rejected)
            .collect();
        (rejected, buffer.finalize(CfaPattern::Rggb))
    }

    #[test]
    fn test_gaussian_kernel_counts_each_frame_once() {
        let (w, h) = (16, 16);
        let grid = grid_for(DrizzleKernel::Gaussian, w, h);
        let mut frames = spiked_frames(2, w, h);
        frames[1].data = frames[0].data.clone();
        frames[1].data[SPIKE.1 * w + SPIKE.0] -= 3000.0;

        let identity = GeometricTransform::identity();
        let mut rejector = SigmaRejector::new(&grid, thresholds(), 5);
        for frame in &frames {
            rejector.observe(&grid, frame, &identity);
        }
        for i in 0..w * h {
            for plane in 0..4 {
                assert!(rejector.samples(i, plane) <= 2, "pixel {} plane {}", i, plane);
            }
        }

        let (rejected, _) = stack(&grid, &frames);
        assert_eq!(rejected, vec![0, 0]);
    }

    #[test]
    fn test_minimum_frame_count_for_every_kernel() {
        let (w, h) = (16, 16);
        let spike = SPIKE.1 * w + SPIKE.0;
        let expected = base(w, h)[spike];

        for kernel in [DrizzleKernel::Gaussian, DrizzleKernel::Square, DrizzleKernel::Nearest] {
            let grid = grid_for(kernel, w, h);

            // Five frames: four others at every pixel, below the minimum of five
            let (rejected, planes) = stack(&grid, &spiked_frames(5, w, h));
            assert!(rejected.iter().all(|&r| r == 0), "{:?}: {:?}", kernel, rejected);
            let kept = planes.plane(0).get(spike).unwrap();
            assert!(kept > expected + 500.0, "{:?}: {}", kernel, kept);

            // Six frames: the hit is rejected, nothing else is
            let (rejected, planes) = stack(&grid, &spiked_frames(6, w, h));
            assert!(rejected[0] > 0, "{:?}: {:?}", kernel, rejected);
            assert!(rejected[1..].iter().all(|&r| r == 0), "{:?}: {:?}", kernel, rejected);
            let cleaned = planes.plane(0).get(spike).unwrap();
            assert!((cleaned - expected).abs() < 1.5, "{:?}: {}", kernel, cleaned);
        }
    }

    #[test]
    fn test_satellite_trail_removed_from_stack() {
        let (w, h) = (16, 16);
        let params = DrizzleParams {
            kernel: DrizzleKernel::Nearest,
            scale: 1.0,
            pixfrac: 1.0,
        };
        let grid = DrizzleGrid::new(params, w, h);
        let base: Vec<f32> = (0..w * h).map(|i| 200.0 + (i % 7) as f32).collect();

        let mut frames: Vec<RasterFrame> = (0..12)
            .map(|k| {
                let data = base.iter().map(|v| v + (k % 3) as f32 - 1.0).collect();
                RasterFrame::synthetic(&format!("l{}", k), w, h, data)
            })
            .collect();
        // Trail across row 5 of one frame
        for x in 0..w {
            frames[4].data[5 * w + x] += 3000.0;
        }

        let identity = GeometricTransform::identity();
        let mut rejector = SigmaRejector::new(&grid, thresholds(), 5);
        for frame in &frames {
            rejector.observe(&grid, frame, &identity);
        }
        assert_eq!(rejector.samples(5 * w + 3, 3), 12);

        let mut buffer = AccumulationBuffer::new(&grid);
        let mut rejected = 0;
        for frame in &frames {
            rejected += buffer.accumulate(&grid, frame, &identity, Some(&rejector)).rejected;
        }
        assert_eq!(rejected, w as u64);

        let planes = buffer.finalize(CfaPattern::Rggb);
        for x in 0..w {
            let i = 5 * w + x;
            let position = crate::frame::cfa_position(x, 5);
            let value = planes.plane(position).get(i).unwrap();
            assert!((value - base[i]).abs() < 1.0, "x={} value={}", x, value);
        }
    }
}
