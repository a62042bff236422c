//! Robust statistics shared by mastering, defect detection, normalization
//! and rejection.

/// MAD to standard deviation for normally distributed data
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Median of a scratch slice. Reorders the slice.
pub fn median_in_place(values: &mut [f32]) -> Option<f32> {
    let len = values.len();
    if len == 0 {
        return None;
    }
    let mid = len / 2;
    let (_, upper, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let upper = *upper;
    if len % 2 == 1 {
        return Some(upper);
    }
    let lower = values[..mid]
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    Some((lower + upper) / 2.0)
}

/// Median absolute deviation around `center`. Overwrites the slice.
pub fn mad_in_place(values: &mut [f32], center: f32) -> Option<f32> {
    for v in values.iter_mut() {
        *v = (*v - center).abs();
    }
    median_in_place(values)
}

/// Median and MAD-based sigma of a sample, leaving the input untouched.
pub fn median_sigma(values: &[f32]) -> Option<(f32, f32)> {
    let mut scratch = values.to_vec();
    let median = median_in_place(&mut scratch)?;
    let mad = mad_in_place(&mut scratch, median)?;
    Some((median, (mad as f64 * MAD_TO_SIGMA) as f32))
}

/// Iterative sigma-clipped mean. Each pass centers on the median of the
/// surviving samples and clips at `low`/`high` MAD-sigmas; stops when nothing
/// is clipped. `scratch` must be at least as long as `values`.
///
/// The result is always within the min/max of `values`.
pub fn sigma_clipped_mean(
    values: &mut [f32],
    scratch: &mut [f32],
    low: f64,
    high: f64,
    max_iterations: usize,
) -> Option<f32> {
    let mut n = values.len();
    if n == 0 {
        return None;
    }

    for _ in 0..max_iterations {
        if n < 3 {
            break;
        }
        scratch[..n].copy_from_slice(&values[..n]);
        let median = median_in_place(&mut scratch[..n])?;
        let mad = mad_in_place(&mut scratch[..n], median)?;
        let sigma = mad as f64 * MAD_TO_SIGMA;
        if sigma <= f64::EPSILON {
            break;
        }
        let lo = median as f64 - low * sigma;
        let hi = median as f64 + high * sigma;

        let mut kept = 0;
        for i in 0..n {
            let v = values[i] as f64;
            if v >= lo && v <= hi {
                values[kept] = values[i];
                kept += 1;
            }
        }
        if kept == n || kept == 0 {
            break;
        }
        n = kept;
    }

    let sum: f64 = values[..n].iter().map(|&v| v as f64).sum();
    Some((sum / n as f64) as f32)
}

/// Kappa-Sigma noise estimation: iteratively drops values above
/// mean + kappa * sigma until sigma converges.
#[derive(Debug, Clone, Copy)]
pub struct KappaSigma {
    pub sigma: f64,
    pub background_mean: f64,
}

pub fn kappa_sigma_noise_estimate(data: &[f32], clipping_multiplier: f64) -> KappaSigma {
    let allowed_error = 0.00001;
    let max_iterations = 5;
    let mut threshold = f64::MAX;
    let mut last_sigma = 1.0;
    let mut last_mean = 1.0;

    for iteration in 0..max_iterations {
        let (count, sum, sum_sq) = data
            .iter()
            .map(|&v| v as f64)
            .filter(|&v| iteration == 0 || v < threshold - f64::EPSILON)
            .fold((0usize, 0.0f64, 0.0f64), |(n, s, sq), v| (n + 1, s + v, sq + v * v));

        if count == 0 {
            break;
        }

        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        let sigma = variance.sqrt();

        if iteration > 0 && (sigma - last_sigma).abs() <= allowed_error {
            last_sigma = sigma;
            last_mean = mean;
            break;
        }

        threshold = mean + clipping_multiplier * sigma;
        last_sigma = sigma;
        last_mean = mean;
    }

    KappaSigma {
        sigma: last_sigma,
        background_mean: last_mean,
    }
}

/// Welford running mean/variance. Stored in single precision so a full
/// output grid of them stays affordable; updates are done in f64.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStat {
    pub count: u32,
    pub mean: f32,
    pub m2: f32,
}

impl RunningStat {
    #[inline]
    pub fn push(&mut self, x: f32) {
        self.count += 1;
        let x = x as f64;
        let mean = self.mean as f64;
        let delta = x - mean;
        let new_mean = mean + delta / self.count as f64;
        self.m2 = (self.m2 as f64 + delta * (x - new_mean)) as f32;
        self.mean = new_mean as f32;
    }

    /// Statistics of every sample except `x`, which must have been pushed.
    /// Returns (count, mean, population sigma).
    #[inline]
    pub fn without(&self, x: f32) -> (u32, f64, f64) {
        if self.count <= 1 {
            return (0, 0.0, 0.0);
        }
        let x = x as f64;
        let n = self.count as f64;
        let mean = self.mean as f64;
        let mean_o = (n * mean - x) / (n - 1.0);
        let m2_o = (self.m2 as f64 - (x - mean) * (x - mean_o)).max(0.0);
        let sigma_o = (m2_o / (n - 1.0)).sqrt();
        (self.count - 1, mean_o, sigma_o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median_in_place(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median_in_place(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median_in_place(&mut []), None);
    }

    #[test]
    fn test_median_sigma() {
        let (median, sigma) = median_sigma(&[10.0, 11.0, 9.0, 10.0, 100.0]).unwrap();
        assert_eq!(median, 10.0);
        assert!((sigma - 1.4826).abs() < 1e-4);
    }

    #[test]
    fn test_sigma_clipped_mean_drops_cosmic_ray() {
        let mut values = [100.0, 101.0, 99.0, 100.0, 102.0, 98.0, 5000.0];
        let mut scratch = [0.0; 7];
        let mean = sigma_clipped_mean(&mut values, &mut scratch, 3.0, 3.0, 5).unwrap();
        assert!((mean - 100.0).abs() < 0.01, "mean was {}", mean);
    }

    #[test]
    fn test_sigma_clipped_mean_within_range() {
        let mut values = [7.0, 7.0];
        let mut scratch = [0.0; 2];
        assert_eq!(
            sigma_clipped_mean(&mut values, &mut scratch, 3.0, 3.0, 5),
            Some(7.0)
        );
    }

    #[test]
    fn test_kappa_sigma_ignores_bright_tail() {
        let mut data: Vec<f32> = (0..1000).map(|i| 100.0 + (i % 7) as f32 - 3.0).collect();
        data.extend(std::iter::repeat(60000.0).take(10));
        let estimate = kappa_sigma_noise_estimate(&data, 3.0);
        assert!((estimate.background_mean - 100.0).abs() < 1.0);
        assert!(estimate.sigma < 5.0);
    }

    #[test]
    fn test_running_stat_leave_one_out() {
        let samples = [10.0, 12.0, 11.0, 9.0, 50.0];
        let mut stat = RunningStat::default();
        for s in samples {
            stat.push(s);
        }
        let (count, mean_o, sigma_o) = stat.without(50.0);
        assert_eq!(count, 4);
        assert!((mean_o - 10.5).abs() < 1e-4);
        let expected_sigma = (((10.0f64 - 10.5).powi(2)
            + (12.0f64 - 10.5).powi(2)
            + (11.0f64 - 10.5).powi(2)
            + (9.0f64 - 10.5).powi(2))
            / 4.0)
            .sqrt();
        assert!((sigma_o - expected_sigma).abs() < 1e-4);
    }

    #[test]
    fn test_running_stat_matches_batch_variance() {
        let samples = [1000.0f32, 1004.0, 998.0, 1001.0, 997.0, 1003.0];
        let mut stat = RunningStat::default();
        for s in samples {
            stat.push(s);
        }
        let mean = samples.iter().map(|&v| v as f64).sum::<f64>() / 6.0;
        let m2: f64 = samples.iter().map(|&v| (v as f64 - mean).powi(2)).sum();
        assert!((stat.mean as f64 - mean).abs() < 1e-3);
        assert!((stat.m2 as f64 - m2).abs() < 1e-2);
    }
}
