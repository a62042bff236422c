//! Bayer drizzle: every calibrated mosaic pixel is dropped, with the
//! footprint of its kernel, onto the output grid plane of its CFA position.
//! Demosaicing happens once, on the accumulated planes.
//!
//! The output grid is processed in row bands owned by one worker each, so a
//! pixel's value and weight are always updated together by a single thread.

use crate::config::{DrizzleKernel, DrizzleParams};
use crate::frame::{cfa_position, CfaPattern, RasterFrame};
use crate::registration::GeometricTransform;
use crate::rejection::SigmaRejector;
use rayon::prelude::*;

/// Output rows per work unit
pub(crate) const BAND_ROWS: usize = 32;
const GAUSSIAN_FWHM_TO_SIGMA: f64 = 2.354_820_045;
/// Overlaps below this fraction of a footprint are numerical noise
const MIN_OVERLAP: f64 = 1e-9;

/// Output geometry and kernel for one run.
#[derive(Debug, Clone)]
pub struct DrizzleGrid {
    pub params: DrizzleParams,
    pub input_width: usize,
    pub input_height: usize,
    pub width: usize,
    pub height: usize,
}

impl DrizzleGrid {
    pub fn new(params: DrizzleParams, input_width: usize, input_height: usize) -> Self {
        Self {
            params,
            input_width,
            input_height,
            width: (input_width as f64 * params.scale).round() as usize,
            height: (input_height as f64 * params.scale).round() as usize,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Frame pixel -> output pixel. Output pixel `j` is centered on `j` and
    /// spans `[j - 0.5, j + 0.5)`, so the reference grid is scaled about the
    /// outer pixel edges.
    pub fn output_transform(&self, frame_to_reference: &GeometricTransform) -> GeometricTransform {
        let s = self.params.scale;
        let offset = (s - 1.0) / 2.0;
        GeometricTransform::new(
            frame_to_reference.rotation,
            frame_to_reference.scale * s,
            frame_to_reference.tx * s + offset,
            frame_to_reference.ty * s + offset,
        )
    }

    /// Calls `emit(x, y, weight)` for every output pixel the footprint of
    /// input pixel `(ix, iy)` lands on. Weights of a footprint sum to 1 when
    /// it lies fully inside the grid.
    pub fn splat(
        &self,
        to_output: &GeometricTransform,
        ix: usize,
        iy: usize,
        emit: &mut impl FnMut(usize, usize, f32),
    ) {
        match self.params.kernel {
            DrizzleKernel::Square => self.splat_square(to_output, ix as f64, iy as f64, emit),
            DrizzleKernel::Gaussian => self.splat_gaussian(to_output, ix as f64, iy as f64, emit),
            DrizzleKernel::Nearest => {
                let (cx, cy) = to_output.apply(ix as f64, iy as f64);
                if let Some((ox, oy)) = self.cell_of(cx, cy) {
                    emit(ox, oy, 1.0);
                }
            }
        }
    }

    fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let ox = x.round();
        let oy = y.round();
        if ox < 0.0 || oy < 0.0 || ox >= self.width as f64 || oy >= self.height as f64 {
            return None;
        }
        Some((ox as usize, oy as usize))
    }

    fn splat_square(
        &self,
        to_output: &GeometricTransform,
        ix: f64,
        iy: f64,
        emit: &mut impl FnMut(usize, usize, f32),
    ) {
        let half = self.params.pixfrac / 2.0;
        let quad = [
            to_output.apply(ix - half, iy - half),
            to_output.apply(ix + half, iy - half),
            to_output.apply(ix + half, iy + half),
            to_output.apply(ix - half, iy + half),
        ];
        let side = self.params.pixfrac * to_output.scale;
        let quad_area = side * side;

        let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
        for &(x, y) in &quad {
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);
        }

        let x0 = (min_x + 0.5).floor().max(0.0) as i64;
        let y0 = (min_y + 0.5).floor().max(0.0) as i64;
        let x1 = ((max_x + 0.5).floor() as i64).min(self.width as i64 - 1);
        let y1 = ((max_y + 0.5).floor() as i64).min(self.height as i64 - 1);

        for oy in y0..=y1 {
            for ox in x0..=x1 {
                let cell = (ox as f64 - 0.5, ox as f64 + 0.5, oy as f64 - 0.5, oy as f64 + 0.5);
                let overlap = clipped_area(&quad, cell);
                let weight = overlap / quad_area;
                if weight > MIN_OVERLAP {
                    emit(ox as usize, oy as usize, weight as f32);
                }
            }
        }
    }

    fn splat_gaussian(
        &self,
        to_output: &GeometricTransform,
        ix: f64,
        iy: f64,
        emit: &mut impl FnMut(usize, usize, f32),
    ) {
        let (cx, cy) = to_output.apply(ix, iy);
        let sigma = self.params.pixfrac * self.params.scale / GAUSSIAN_FWHM_TO_SIGMA;
        let two_sigma_sq = 2.0 * sigma * sigma;
        let (nx, ny) = (cx.round(), cy.round());

        let mut weights = [(0i64, 0i64, 0f64); 9];
        let mut total = 0.0;
        let mut n = 0;
        for dy in -1..=1 {
            for dx in -1..=1 {
                let ox = nx + dx as f64;
                let oy = ny + dy as f64;
                let r2 = (ox - cx).powi(2) + (oy - cy).powi(2);
                let w = (-r2 / two_sigma_sq).exp();
                total += w;
                weights[n] = (ox as i64, oy as i64, w);
                n += 1;
            }
        }
        if total <= 0.0 {
            return;
        }
        for &(ox, oy, w) in &weights[..n] {
            if ox < 0 || oy < 0 || ox >= self.width as i64 || oy >= self.height as i64 {
                continue;
            }
            let weight = w / total;
            if weight > MIN_OVERLAP {
                emit(ox as usize, oy as usize, weight as f32);
            }
        }
    }

    /// Visits every contribution of `frame` that lands in output rows
    /// `y0..y1`, as `(plane, x, y, weight, value)`.
    pub(crate) fn for_each_in_band(
        &self,
        frame: &RasterFrame,
        to_output: &GeometricTransform,
        y0: usize,
        y1: usize,
        mut visit: impl FnMut(usize, usize, usize, f32, f32),
    ) {
        let Some((ix0, iy0, ix1, iy1)) = self.input_window(to_output, y0, y1) else {
            return;
        };
        let width = frame.width();
        for iy in iy0..=iy1 {
            for ix in ix0..=ix1 {
                let value = frame.data[iy * width + ix];
                if !value.is_finite() {
                    continue;
                }
                let plane = cfa_position(ix, iy);
                self.splat(to_output, ix, iy, &mut |ox, oy, w| {
                    if oy >= y0 && oy < y1 {
                        visit(plane, ox, oy, w, value);
                    }
                });
            }
        }
    }

    /// Sums the weighted contributions of `frame` to output rows `y0..y1`
    /// into `cells`, which hold exactly those rows.
    pub(crate) fn splat_band(
        &self,
        frame: &RasterFrame,
        to_output: &GeometricTransform,
        y0: usize,
        y1: usize,
        cells: &mut [AccumCell],
    ) {
        let width = self.width;
        self.for_each_in_band(frame, to_output, y0, y1, |plane, ox, oy, w, value| {
            let cell = &mut cells[(oy - y0) * width + ox];
            cell.value[plane] += w * value;
            cell.weight[plane] += w;
        });
    }

    /// Input pixels whose footprint can reach output rows `y0..y1`.
    fn input_window(
        &self,
        to_output: &GeometricTransform,
        y0: usize,
        y1: usize,
    ) -> Option<(usize, usize, usize, usize)> {
        let from_output = to_output.inverse();
        let corners = [
            (-0.5, y0 as f64 - 0.5),
            (self.width as f64 - 0.5, y0 as f64 - 0.5),
            (-0.5, y1 as f64 - 0.5),
            (self.width as f64 - 0.5, y1 as f64 - 0.5),
        ];
        let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            let (ix, iy) = from_output.apply(x, y);
            min_x = min_x.min(ix);
            max_x = max_x.max(ix);
            min_y = min_y.min(iy);
            max_y = max_y.max(iy);
        }
        // Footprints reach at most 1.5 output pixels from their center
        let margin = 2.0 / to_output.scale + 1.0;
        let ix0 = (min_x - margin).floor().max(0.0);
        let iy0 = (min_y - margin).floor().max(0.0);
        let ix1 = (max_x + margin).ceil().min(self.input_width as f64 - 1.0);
        let iy1 = (max_y + margin).ceil().min(self.input_height as f64 - 1.0);
        if ix0 > ix1 || iy0 > iy1 {
            return None;
        }
        Some((ix0 as usize, iy0 as usize, ix1 as usize, iy1 as usize))
    }
}

/// Area of the convex quad `poly` inside the axis-aligned box
/// `(x0, x1, y0, y1)` (Sutherland-Hodgman clipping).
fn clipped_area(poly: &[(f64, f64); 4], (x0, x1, y0, y1): (f64, f64, f64, f64)) -> f64 {
    let mut buf_a = [(0.0, 0.0); 8];
    let mut buf_b = [(0.0, 0.0); 8];
    buf_a[..4].copy_from_slice(poly);
    let mut n = 4;

    // (axis, bound, keep >= bound)
    let edges = [(0, x0, true), (0, x1, false), (1, y0, true), (1, y1, false)];
    for (axis, bound, keep_above) in edges {
        let inside = |p: (f64, f64)| {
            let v = if axis == 0 { p.0 } else { p.1 };
            if keep_above {
                v >= bound
            } else {
                v <= bound
            }
        };
        let mut m = 0;
        for i in 0..n {
            let current = buf_a[i];
            let previous = buf_a[(i + n - 1) % n];
            let (cur_in, prev_in) = (inside(current), inside(previous));
            if cur_in != prev_in {
                let (pa, ca) = if axis == 0 {
                    (previous.0, current.0)
                } else {
                    (previous.1, current.1)
                };
                let t = (bound - pa) / (ca - pa);
                if m < 8 {
                    buf_b[m] = (
                        previous.0 + t * (current.0 - previous.0),
                        previous.1 + t * (current.1 - previous.1),
                    );
                    m += 1;
                }
            }
            if cur_in && m < 8 {
                buf_b[m] = current;
                m += 1;
            }
        }
        if m < 3 {
            return 0.0;
        }
        std::mem::swap(&mut buf_a, &mut buf_b);
        n = m;
    }

    let mut twice_area = 0.0;
    for i in 0..n {
        let (xa, ya) = buf_a[i];
        let (xb, yb) = buf_a[(i + 1) % n];
        twice_area += xa * yb - xb * ya;
    }
    twice_area.abs() / 2.0
}

/// Value and weight of the four CFA-position planes at one output pixel.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccumCell {
    pub value: [f32; 4],
    pub weight: [f32; 4],
}

impl AccumCell {
    /// Weighted mean of one plane, if it received any weight.
    #[inline]
    pub fn mean(&self, plane: usize) -> Option<f32> {
        let w = self.weight[plane];
        (w > 0.0).then(|| self.value[plane] / w)
    }
}

/// Counts of one frame's contributions, one per output pixel and plane it
/// reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Contribution {
    pub accepted: u64,
    pub rejected: u64,
}

impl Contribution {
    fn merge(self, other: Contribution) -> Contribution {
        Contribution {
            accepted: self.accepted + other.accepted,
            rejected: self.rejected + other.rejected,
        }
    }
}

/// Running weighted sums per output pixel and CFA plane.
#[derive(Debug, Clone)]
pub struct AccumulationBuffer {
    width: usize,
    height: usize,
    cells: Vec<AccumCell>,
    frames: usize,
}

impl AccumulationBuffer {
    pub fn new(grid: &DrizzleGrid) -> Self {
        Self {
            width: grid.width,
            height: grid.height,
            cells: vec![AccumCell::default(); grid.pixel_count()],
            frames: 0,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn cells(&self) -> &[AccumCell] {
        &self.cells
    }

    /// Drizzle one calibrated frame. Each output pixel and plane gets the
    /// frame's weighted mean there; with a rejector, means it flags as
    /// outliers are left out of both value and weight.
    pub fn accumulate(
        &mut self,
        grid: &DrizzleGrid,
        frame: &RasterFrame,
        frame_to_reference: &GeometricTransform,
        rejector: Option<&SigmaRejector>,
    ) -> Contribution {
        let to_output = grid.output_transform(frame_to_reference);
        let width = self.width;

        let contribution = self
            .cells
            .par_chunks_mut(BAND_ROWS * width)
            .enumerate()
            .map(|(band, cells)| {
                let y0 = band * BAND_ROWS;
                let y1 = y0 + cells.len() / width;
                let mut own = vec![AccumCell::default(); cells.len()];
                grid.splat_band(frame, &to_output, y0, y1, &mut own);

                let mut counts = Contribution::default();
                for (offset, (cell, own)) in cells.iter_mut().zip(&own).enumerate() {
                    for plane in 0..4 {
                        let Some(value) = own.mean(plane) else {
                            continue;
                        };
                        if let Some(rejector) = rejector {
                            if !rejector.keep(y0 * width + offset, plane, value) {
                                counts.rejected += 1;
                                continue;
                            }
                        }
                        cell.value[plane] += own.value[plane];
                        cell.weight[plane] += own.weight[plane];
                        counts.accepted += 1;
                    }
                }
                counts
            })
            .reduce(Contribution::default, Contribution::merge);

        self.frames += 1;
        contribution
    }

    /// Divide value by weight. Pixels without weight become no-data.
    pub fn finalize(self, cfa: CfaPattern) -> FinalizedPlanes {
        let n = self.cells.len();
        let mut planes: [FinalPlane; 4] = std::array::from_fn(|_| FinalPlane {
            value: vec![0.0; n],
            weight: vec![0.0; n],
        });
        for (i, cell) in self.cells.iter().enumerate() {
            for (p, plane) in planes.iter_mut().enumerate() {
                let w = cell.weight[p];
                if w > 0.0 {
                    plane.value[i] = cell.value[p] / w;
                    plane.weight[i] = w;
                }
            }
        }
        FinalizedPlanes {
            width: self.width,
            height: self.height,
            cfa,
            frames: self.frames,
            planes,
        }
    }
}

/// One normalized CFA-position plane.
#[derive(Debug, Clone)]
pub struct FinalPlane {
    value: Vec<f32>,
    weight: Vec<f32>,
}

impl FinalPlane {
    #[inline]
    pub fn get(&self, i: usize) -> Option<f32> {
        if self.weight[i] > 0.0 {
            Some(self.value[i])
        } else {
            None
        }
    }

    #[inline]
    pub fn weight(&self, i: usize) -> f32 {
        self.weight[i]
    }

    pub fn values(&self) -> &[f32] {
        &self.value
    }

    pub fn weights(&self) -> &[f32] {
        &self.weight
    }

    /// Fraction of pixels with any weight
    pub fn coverage(&self) -> f64 {
        if self.weight.is_empty() {
            return 0.0;
        }
        self.weight.iter().filter(|&&w| w > 0.0).count() as f64 / self.weight.len() as f64
    }
}

/// Accumulated planes after normalization; read-only from here on.
#[derive(Debug, Clone)]
pub struct FinalizedPlanes {
    pub width: usize,
    pub height: usize,
    pub cfa: CfaPattern,
    pub frames: usize,
    planes: [FinalPlane; 4],
}

impl FinalizedPlanes {
    /// Plane of CFA position `0..4` ((0,0), (1,0), (0,1), (1,1)).
    pub fn plane(&self, position: usize) -> &FinalPlane {
        &self.planes[position]
    }

    pub fn planes(&self) -> &[FinalPlane; 4] {
        &self.planes
    }
}
