use crate::config::{DefectParams, SigmaThresholds};
use crate::error::{Result, SkipReason, StackError};
use crate::frame::{cfa_position, RasterFrame, SensorGeometry};
use crate::statistics::{mad_in_place, median_in_place, median_sigma, sigma_clipped_mean, MAD_TO_SIGMA};
use bumpalo::Bump;
use rayon::prelude::*;
use serde::Serialize;

const MAX_CLIP_ITERATIONS: usize = 5;
/// Lower bound on the noise estimate so perfectly flat masters don't flag
/// rounding noise
const NOISE_FLOOR: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectKind {
    Hot,
    Cold,
}

const FLAG_NONE: u8 = 0;
const FLAG_HOT: u8 = 1;
const FLAG_COLD: u8 = 2;

/// Pixels of the master that stand out from their same-color neighborhood.
#[derive(Debug, Clone)]
pub struct DefectMask {
    width: usize,
    height: usize,
    flags: Vec<u8>,
    flagged: Vec<usize>,
}

impl DefectMask {
    /// Flags pixels deviating from the median of their eight same-color
    /// neighbors by more than the configured multiple of the local noise.
    /// Local noise is the larger of the neighborhood MAD-sigma and the
    /// MAD-sigma of the whole CFA plane.
    pub fn detect(master: &[f32], width: usize, height: usize, params: &DefectParams) -> Self {
        let plane_sigma = plane_noise(master, width, height);
        let hot = params.hot_sigma as f32;
        let cold = params.cold_sigma as f32;

        let mut flags = vec![FLAG_NONE; width * height];
        flags
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                let mut window = [0f32; 8];
                for (x, flag) in row.iter_mut().enumerate() {
                    let n = gather_neighbors(master, width, height, x, y, &mut window, |_| true);
                    if n < 3 {
                        continue;
                    }
                    let Some(median) = median_in_place(&mut window[..n]) else {
                        continue;
                    };
                    let local = mad_in_place(&mut window[..n], median).unwrap_or(0.0)
                        * MAD_TO_SIGMA as f32;
                    let noise = local.max(plane_sigma[cfa_position(x, y)]).max(NOISE_FLOOR);
                    let deviation = master[y * width + x] - median;
                    if deviation > hot * noise {
                        *flag = FLAG_HOT;
                    } else if deviation < -cold * noise {
                        *flag = FLAG_COLD;
                    }
                }
            });

        let flagged = flags
            .iter()
            .enumerate()
            .filter(|(_, f)| **f != FLAG_NONE)
            .map(|(i, _)| i)
            .collect();

        Self {
            width,
            height,
            flags,
            flagged,
        }
    }

    pub fn kind_at(&self, x: usize, y: usize) -> Option<DefectKind> {
        match self.flags[y * self.width + x] {
            FLAG_HOT => Some(DefectKind::Hot),
            FLAG_COLD => Some(DefectKind::Cold),
            _ => None,
        }
    }

    #[inline]
    pub fn is_flagged_index(&self, i: usize) -> bool {
        self.flags[i] != FLAG_NONE
    }

    pub fn len(&self) -> usize {
        self.flagged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flagged.is_empty()
    }

    pub fn hot_count(&self) -> usize {
        self.flagged.iter().filter(|&&i| self.flags[i] == FLAG_HOT).count()
    }

    pub fn cold_count(&self) -> usize {
        self.flagged.iter().filter(|&&i| self.flags[i] == FLAG_COLD).count()
    }

    pub fn coordinates(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.flagged.iter().map(|&i| (i % self.width, i / self.width))
    }

    /// Replace every flagged pixel by the median of its unflagged same-color
    /// neighbors. Pixels with no unflagged neighbor are left alone.
    pub fn correct(&self, data: &mut [f32]) {
        let mut window = [0f32; 8];
        for &i in &self.flagged {
            let (x, y) = (i % self.width, i / self.width);
            let n = gather_neighbors(data, self.width, self.height, x, y, &mut window, |j| {
                !self.is_flagged_index(j)
            });
            if let Some(median) = median_in_place(&mut window[..n]) {
                data[i] = median;
            }
        }
    }
}

/// Collects up to eight same-color neighbors (distance 2 on the mosaic)
/// accepted by `keep`. Returns how many were written.
fn gather_neighbors(
    data: &[f32],
    width: usize,
    height: usize,
    x: usize,
    y: usize,
    window: &mut [f32; 8],
    keep: impl Fn(usize) -> bool,
) -> usize {
    let mut n = 0;
    for dy in [-2isize, 0, 2] {
        for dx in [-2isize, 0, 2] {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = x as isize + dx;
            let ny = y as isize + dy;
            if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                continue;
            }
            let j = ny as usize * width + nx as usize;
            if keep(j) {
                window[n] = data[j];
                n += 1;
            }
        }
    }
    n
}

/// MAD-sigma of each of the four CFA planes
fn plane_noise(data: &[f32], width: usize, height: usize) -> [f32; 4] {
    let mut sigma = [0f32; 4];
    for (pos, slot) in sigma.iter_mut().enumerate() {
        let (ox, oy) = (pos & 1, pos >> 1);
        let plane: Vec<f32> = (oy..height)
            .step_by(2)
            .flat_map(|y| (ox..width).step_by(2).map(move |x| data[y * width + x]))
            .collect();
        *slot = median_sigma(&plane).map(|(_, s)| s).unwrap_or(0.0);
    }
    sigma
}

/// Combined dark frame plus its defect map. Read-only once built.
#[derive(Debug, Clone)]
pub struct CalibrationMaster {
    pub geometry: SensorGeometry,
    pub data: Vec<f32>,
    pub defects: DefectMask,
    pub frame_count: usize,
    /// Mean dark exposure in seconds, when the darks recorded one
    pub exposure: Option<f64>,
    pub carried_headers: Vec<(String, String)>,
}

impl CalibrationMaster {
    /// Combine darks that share one framing. One dark is used as is, two are
    /// averaged, three or more go through a per-pixel sigma-clipped mean.
    pub fn from_darks(
        darks: &[RasterFrame],
        sigma: SigmaThresholds,
        params: &DefectParams,
    ) -> Result<Self> {
        let first = darks
            .first()
            .ok_or_else(|| StackError::Config("no dark frames to combine".to_string()))?;
        let geometry = first.geometry;
        if let Some(odd) = darks.iter().find(|d| !d.geometry.same_framing(&geometry)) {
            return Err(StackError::raster(
                &odd.path,
                format!(
                    "dark is {}x{}, first dark is {}x{}",
                    odd.width(),
                    odd.height(),
                    geometry.width,
                    geometry.height
                ),
            ));
        }

        let data = match darks.len() {
            1 => first.data.clone(),
            2 => first
                .data
                .iter()
                .zip(&darks[1].data)
                .map(|(a, b)| (a + b) / 2.0)
                .collect(),
            _ => combine_sigma_clipped(darks, geometry.width, sigma),
        };

        let defects = DefectMask::detect(&data, geometry.width, geometry.height, params);
        tracing::info!(
            "Master dark from {} frame(s): {} hot and {} cold pixel(s) flagged",
            darks.len(),
            defects.hot_count(),
            defects.cold_count()
        );

        let exposures: Vec<f64> = darks.iter().filter_map(|d| d.exposure).collect();
        let exposure = if exposures.is_empty() {
            None
        } else {
            Some(exposures.iter().sum::<f64>() / exposures.len() as f64)
        };

        Ok(Self {
            geometry,
            data,
            defects,
            frame_count: darks.len(),
            exposure,
            carried_headers: first.carried_headers.clone(),
        })
    }

    /// Dark subtraction followed by cosmetic correction.
    pub fn calibrate(&self, frame: RasterFrame) -> std::result::Result<RasterFrame, SkipReason> {
        if !frame.geometry.same_framing(&self.geometry) {
            return Err(SkipReason::GeometryMismatch {
                expected: (self.geometry.width, self.geometry.height),
                found: (frame.width(), frame.height()),
            });
        }
        let mut frame = frame;
        for (px, dark) in frame.data.iter_mut().zip(&self.data) {
            *px -= dark;
        }
        self.defects.correct(&mut frame.data);
        Ok(frame)
    }
}

fn combine_sigma_clipped(darks: &[RasterFrame], width: usize, sigma: SigmaThresholds) -> Vec<f32> {
    let n = darks.len();
    let mut out = vec![0f32; darks[0].data.len()];
    out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        let arena = Bump::new();
        let mut window = bumpalo::vec![in &arena; 0f32; n];
        let mut scratch = bumpalo::vec![in &arena; 0f32; n];
        for (x, px) in row.iter_mut().enumerate() {
            let i = y * width + x;
            for (slot, dark) in window.iter_mut().zip(darks) {
                *slot = dark.data[i];
            }
            *px = sigma_clipped_mean(
                &mut window,
                &mut scratch,
                sigma.low,
                sigma.high,
                MAX_CLIP_ITERATIONS,
            )
            .unwrap_or(0.0);
        }
    });
    out
}

/// How light frames are calibrated for this run.
#[derive(Debug, Clone)]
pub enum Calibration {
    /// No darks were found; frames pass through untouched
    Passthrough,
    Master(Box<CalibrationMaster>),
}

impl Calibration {
    pub fn calibrate(&self, frame: RasterFrame) -> std::result::Result<RasterFrame, SkipReason> {
        match self {
            Calibration::Passthrough => Ok(frame),
            Calibration::Master(master) => master.calibrate(frame),
        }
    }

    pub fn master(&self) -> Option<&CalibrationMaster> {
        match self {
            Calibration::Passthrough => None,
            Calibration::Master(master) => Some(master),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sigma() -> SigmaThresholds {
        SigmaThresholds {
            low: 3.0,
            high: 3.0,
        }
    }

    fn noisy_dark(rng: &mut StdRng, name: &str, w: usize, h: usize) -> RasterFrame {
        let data = (0..w * h).map(|_| 100.0 + rng.gen_range(-2.0..2.0)).collect();
        RasterFrame::synthetic(name, w, h, data)
    }

    #[test]
    fn test_master_stays_within_sample_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let (w, h) = (16, 16);
        let mut darks: Vec<RasterFrame> = (0..7)
            .map(|i| noisy_dark(&mut rng, &format!("dark_{}", i), w, h))
            .collect();
        // Cosmic ray hits in a couple of frames
        darks[2].data[40] = 9000.0;
        darks[5].data[41] = -500.0;

        let master = CalibrationMaster::from_darks(&darks, sigma(), &DefectParams::default()).unwrap();
        for i in 0..w * h {
            let min = darks.iter().map(|d| d.data[i]).fold(f32::INFINITY, f32::min);
            let max = darks.iter().map(|d| d.data[i]).fold(f32::NEG_INFINITY, f32::max);
            assert!(
                master.data[i] >= min && master.data[i] <= max,
                "pixel {} = {} outside [{}, {}]",
                i,
                master.data[i],
                min,
                max
            );
        }
        assert!(master.data[40] < 110.0);
        assert!(master.data[41] > 90.0);
    }

    #[test]
    fn test_single_and_pair() {
        let a = RasterFrame::synthetic("a", 2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let b = RasterFrame::synthetic("b", 2, 2, vec![3.0, 2.0, 1.0, 0.0]);

        let single =
            CalibrationMaster::from_darks(&[a.clone()], sigma(), &DefectParams::default()).unwrap();
        assert_eq!(single.data, a.data);
        assert_eq!(single.frame_count, 1);

        let pair = CalibrationMaster::from_darks(&[a, b], sigma(), &DefectParams::default()).unwrap();
        assert_eq!(pair.data, vec![2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_mismatched_darks_are_rejected() {
        let a = RasterFrame::synthetic("a", 2, 2, vec![0.0; 4]);
        let b = RasterFrame::synthetic("b", 4, 2, vec![0.0; 8]);
        assert!(CalibrationMaster::from_darks(&[a, b], sigma(), &DefectParams::default()).is_err());
    }

    #[test]
    fn test_detects_hot_and_cold_pixels() {
        let mut rng = StdRng::seed_from_u64(11);
        let (w, h) = (32, 32);
        let mut darks: Vec<RasterFrame> = (0..8)
            .map(|i| noisy_dark(&mut rng, &format!("dark_{}", i), w, h))
            .collect();
        for dark in darks.iter_mut() {
            dark.data[10 * w + 10] = 5000.0;
            dark.data[20 * w + 21] = 0.0;
        }

        let master = CalibrationMaster::from_darks(&darks, sigma(), &DefectParams::default()).unwrap();
        assert_eq!(master.defects.kind_at(10, 10), Some(DefectKind::Hot));
        assert_eq!(master.defects.kind_at(21, 20), Some(DefectKind::Cold));
        assert!(master.defects.len() < 10, "{} flagged", master.defects.len());
    }

    #[test]
    fn test_calibrate_subtracts_and_corrects() {
        let (w, h) = (12, 12);
        let mut dark = vec![10.0; w * h];
        dark[5 * w + 5] = 1000.0;
        let darks = vec![
            RasterFrame::synthetic("d0", w, h, dark.clone()),
            RasterFrame::synthetic("d1", w, h, dark),
        ];
        let master = CalibrationMaster::from_darks(&darks, sigma(), &DefectParams::default()).unwrap();
        assert_eq!(master.defects.coordinates().collect::<Vec<_>>(), vec![(5, 5)]);

        let mut light = vec![60.0; w * h];
        light[5 * w + 5] = 3000.0;
        let calibrated = master
            .calibrate(RasterFrame::synthetic("l0", w, h, light))
            .unwrap();
        assert!(calibrated.data.iter().all(|&v| (v - 50.0).abs() < 1e-4));
    }

    #[test]
    fn test_calibrate_rejects_other_geometry() {
        let darks = vec![RasterFrame::synthetic("d0", 4, 4, vec![0.0; 16])];
        let master = CalibrationMaster::from_darks(&darks, sigma(), &DefectParams::default()).unwrap();
        let err = master
            .calibrate(RasterFrame::synthetic("l0", 2, 2, vec![0.0; 4]))
            .unwrap_err();
        assert!(matches!(err, SkipReason::GeometryMismatch { .. }));
    }

    #[test]
    fn test_passthrough_returns_input() {
        let mut rng = StdRng::seed_from_u64(3);
        let data: Vec<f32> = (0..64).map(|_| rng.gen_range(0.0..4095.0)).collect();
        let frame = RasterFrame::synthetic("l0", 8, 8, data.clone());
        let out = Calibration::Passthrough.calibrate(frame).unwrap();
        assert_eq!(out.data, data);
    }
}
