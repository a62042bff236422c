//! Frame-to-frame registration under field rotation.
//!
//! Stars of each frame are matched against the reference through
//! similarity-invariant triangles, a RANSAC pass over two-point similarity
//! hypotheses picks the consistent correspondences, and a least-squares SVD
//! fit on the inliers gives the final rotation, translation and (optionally)
//! scale.

use crate::config::RegistrationParams;
use crate::error::SkipReason;
use crate::stars::Star;
use nalgebra::{Matrix2, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;

/// Brightest stars used to build triangles (C(20, 3) = 1140 triangles)
const TRIANGLE_STARS: usize = 20;
const TRIANGLE_TOLERANCE: f64 = 0.01;
/// Triangles with a shorter longest side are too sensitive to centroid noise
const MIN_TRIANGLE_SIDE: f64 = 8.0;
const REFINE_PASSES: usize = 3;

/// Similarity transform from frame pixel coordinates to reference pixel
/// coordinates: `p' = scale * R(rotation) * p + (tx, ty)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeometricTransform {
    /// Radians, counter-clockwise in pixel coordinates
    pub rotation: f64,
    pub scale: f64,
    pub tx: f64,
    pub ty: f64,
}

impl Default for GeometricTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl GeometricTransform {
    pub fn identity() -> Self {
        Self {
            rotation: 0.0,
            scale: 1.0,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub fn new(rotation: f64, scale: f64, tx: f64, ty: f64) -> Self {
        Self {
            rotation,
            scale,
            tx,
            ty,
        }
    }

    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let (sin, cos) = self.rotation.sin_cos();
        (
            self.scale * (cos * x - sin * y) + self.tx,
            self.scale * (sin * x + cos * y) + self.ty,
        )
    }

    pub fn inverse(&self) -> Self {
        let rotation = -self.rotation;
        let scale = 1.0 / self.scale;
        let (sin, cos) = rotation.sin_cos();
        Self {
            rotation,
            scale,
            tx: -scale * (cos * self.tx - sin * self.ty),
            ty: -scale * (sin * self.tx + cos * self.ty),
        }
    }

    pub fn rotation_degrees(&self) -> f64 {
        self.rotation.to_degrees()
    }

    fn from_matrix(r: &Matrix2<f64>, scale: f64, t: Vector2<f64>) -> Self {
        Self {
            rotation: r[(1, 0)].atan2(r[(0, 0)]),
            scale,
            tx: t.x,
            ty: t.y,
        }
    }
}

/// Outcome of registering one frame.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub transform: GeometricTransform,
    /// Star correspondences consistent with the transform
    pub matched: usize,
    /// RMS residual of the inliers, in reference pixels
    pub rms: f64,
}

pub struct Registrar<'a> {
    reference: &'a [Star],
    reference_triangles: Vec<Triangle>,
    params: &'a RegistrationParams,
}

impl<'a> Registrar<'a> {
    pub fn new(reference: &'a [Star], params: &'a RegistrationParams) -> Self {
        let reference_triangles = build_triangles(reference);
        Self {
            reference,
            reference_triangles,
            params,
        }
    }

    /// Register one frame's stars onto the reference. `salt` varies the
    /// RANSAC sequence per frame while keeping runs reproducible.
    pub fn register(&self, stars: &[Star], salt: u64) -> Result<Registration, SkipReason> {
        let required = self.params.min_matches;
        let fail = |matched: usize| SkipReason::RegistrationFailed { matched, required };

        if stars.len() < 3 || self.reference.len() < 3 {
            return Err(fail(stars.len().min(self.reference.len())));
        }

        let candidates = self.vote(stars);
        if candidates.len() < 2 {
            return Err(fail(candidates.len()));
        }

        let mut rng = StdRng::seed_from_u64(self.params.seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let Some(mut transform) = self.ransac(stars, &candidates, &mut rng) else {
            return Err(fail(0));
        };

        let mut pairs = Vec::new();
        for _ in 0..REFINE_PASSES {
            pairs = match_by_distance(stars, self.reference, &transform, self.params.match_tolerance);
            if pairs.len() < 2 {
                break;
            }
            match fit_similarity(stars, self.reference, &pairs, self.params.allow_scale) {
                Some(refined) => transform = refined,
                None => break,
            }
        }
        pairs = match_by_distance(stars, self.reference, &transform, self.params.match_tolerance);

        if pairs.len() < required {
            return Err(fail(pairs.len()));
        }

        let rms = (pairs
            .iter()
            .map(|&(s, r)| {
                let (x, y) = transform.apply(stars[s].x, stars[s].y);
                (x - self.reference[r].x).powi(2) + (y - self.reference[r].y).powi(2)
            })
            .sum::<f64>()
            / pairs.len() as f64)
            .sqrt();

        Ok(Registration {
            transform,
            matched: pairs.len(),
            rms,
        })
    }

    /// Candidate (frame star, reference star) correspondences ranked by the
    /// number of matching triangles they appear in.
    fn vote(&self, stars: &[Star]) -> Vec<(usize, usize)> {
        let mut frame_triangles = build_triangles(stars);
        frame_triangles.sort_by(|a, b| a.ratios.0.total_cmp(&b.ratios.0));

        let mut votes: HashMap<(usize, usize), u32> = HashMap::new();
        for rt in &self.reference_triangles {
            let lo = frame_triangles.partition_point(|t| t.ratios.0 < rt.ratios.0 - TRIANGLE_TOLERANCE);
            for ft in frame_triangles[lo..]
                .iter()
                .take_while(|t| t.ratios.0 <= rt.ratios.0 + TRIANGLE_TOLERANCE)
            {
                if (ft.ratios.1 - rt.ratios.1).abs() > TRIANGLE_TOLERANCE {
                    continue;
                }
                if !self.params.allow_scale && ((ft.longest / rt.longest) - 1.0).abs() > 0.02 {
                    continue;
                }
                for k in 0..3 {
                    *votes.entry((ft.vertices[k], rt.vertices[k])).or_insert(0) += 1;
                }
            }
        }

        let mut ranked: Vec<((usize, usize), u32)> = votes.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        // Greedy one-to-one assignment, strongest votes first
        let mut used_frame = vec![false; stars.len()];
        let mut used_ref = vec![false; self.reference.len()];
        let mut candidates = Vec::new();
        for ((s, r), _) in ranked {
            if used_frame[s] || used_ref[r] {
                continue;
            }
            used_frame[s] = true;
            used_ref[r] = true;
            candidates.push((s, r));
        }
        candidates
    }

    fn ransac(
        &self,
        stars: &[Star],
        candidates: &[(usize, usize)],
        rng: &mut StdRng,
    ) -> Option<GeometricTransform> {
        let tolerance_sq = self.params.match_tolerance.powi(2);
        let mut best: Option<(usize, GeometricTransform)> = None;

        let count_inliers = |t: &GeometricTransform| {
            candidates
                .iter()
                .filter(|&&(s, r)| {
                    let (x, y) = t.apply(stars[s].x, stars[s].y);
                    (x - self.reference[r].x).powi(2) + (y - self.reference[r].y).powi(2)
                        <= tolerance_sq
                })
                .count()
        };

        for _ in 0..self.params.ransac_iterations.max(1) {
            let a = rng.gen_range(0..candidates.len());
            let b = rng.gen_range(0..candidates.len());
            if a == b {
                continue;
            }
            let Some(hypothesis) = two_point_similarity(
                stars,
                self.reference,
                candidates[a],
                candidates[b],
                self.params.allow_scale,
            ) else {
                continue;
            };
            let inliers = count_inliers(&hypothesis);
            if best.as_ref().is_none_or(|(n, _)| inliers > *n) {
                best = Some((inliers, hypothesis));
                if inliers == candidates.len() {
                    break;
                }
            }
        }

        best.filter(|(n, _)| *n >= 2).map(|(_, t)| t)
    }
}

#[derive(Debug, Clone)]
struct Triangle {
    /// Star indices ordered by the length of the opposite side, shortest first
    vertices: [usize; 3],
    /// (shortest / longest, middle / longest)
    ratios: (f64, f64),
    longest: f64,
}

fn build_triangles(stars: &[Star]) -> Vec<Triangle> {
    let n = stars.len().min(TRIANGLE_STARS);
    let mut triangles = Vec::with_capacity(n * n * n / 6);
    let dist = |a: usize, b: usize| ((stars[a].x - stars[b].x).powi(2) + (stars[a].y - stars[b].y).powi(2)).sqrt();

    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                // Side opposite each vertex
                let mut sides = [(dist(j, k), i), (dist(i, k), j), (dist(i, j), k)];
                sides.sort_by(|a, b| a.0.total_cmp(&b.0));
                let longest = sides[2].0;
                if longest < MIN_TRIANGLE_SIDE || sides[0].0 < 1.0 {
                    continue;
                }
                triangles.push(Triangle {
                    vertices: [sides[0].1, sides[1].1, sides[2].1],
                    ratios: (sides[0].0 / longest, sides[1].0 / longest),
                    longest,
                });
            }
        }
    }
    triangles
}

fn two_point_similarity(
    stars: &[Star],
    reference: &[Star],
    (s1, r1): (usize, usize),
    (s2, r2): (usize, usize),
    allow_scale: bool,
) -> Option<GeometricTransform> {
    let src = Vector2::new(stars[s2].x - stars[s1].x, stars[s2].y - stars[s1].y);
    let dst = Vector2::new(reference[r2].x - reference[r1].x, reference[r2].y - reference[r1].y);
    let src_len = src.norm();
    if src_len < MIN_TRIANGLE_SIDE {
        return None;
    }
    let rotation = dst.y.atan2(dst.x) - src.y.atan2(src.x);
    let scale = if allow_scale { dst.norm() / src_len } else { 1.0 };
    let (sin, cos) = rotation.sin_cos();
    let tx = reference[r1].x - scale * (cos * stars[s1].x - sin * stars[s1].y);
    let ty = reference[r1].y - scale * (sin * stars[s1].x + cos * stars[s1].y);
    Some(GeometricTransform::new(rotation, scale, tx, ty))
}

/// One-to-one nearest matches within `tolerance` after applying `transform`.
fn match_by_distance(
    stars: &[Star],
    reference: &[Star],
    transform: &GeometricTransform,
    tolerance: f64,
) -> Vec<(usize, usize)> {
    let tolerance_sq = tolerance * tolerance;
    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    for (s, star) in stars.iter().enumerate() {
        let (x, y) = transform.apply(star.x, star.y);
        for (r, reference_star) in reference.iter().enumerate() {
            let d2 = (x - reference_star.x).powi(2) + (y - reference_star.y).powi(2);
            if d2 <= tolerance_sq {
                candidates.push((d2, s, r));
            }
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut used_frame = vec![false; stars.len()];
    let mut used_ref = vec![false; reference.len()];
    let mut pairs = Vec::new();
    for (_, s, r) in candidates {
        if !used_frame[s] && !used_ref[r] {
            used_frame[s] = true;
            used_ref[r] = true;
            pairs.push((s, r));
        }
    }
    pairs
}

/// Least-squares similarity (Umeyama) over matched pairs via SVD of the
/// cross-covariance.
fn fit_similarity(
    stars: &[Star],
    reference: &[Star],
    pairs: &[(usize, usize)],
    allow_scale: bool,
) -> Option<GeometricTransform> {
    if pairs.len() < 2 {
        return None;
    }
    let src: Vec<Vector2<f64>> = pairs.iter().map(|&(s, _)| Vector2::new(stars[s].x, stars[s].y)).collect();
    let dst: Vec<Vector2<f64>> = pairs
        .iter()
        .map(|&(_, r)| Vector2::new(reference[r].x, reference[r].y))
        .collect();

    let n = pairs.len() as f64;
    let src_centroid = src.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let dst_centroid = dst.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;

    let mut h = Matrix2::zeros();
    let mut src_var = 0.0;
    for (p, q) in src.iter().zip(&dst) {
        let pc = p - src_centroid;
        let qc = q - dst_centroid;
        h += pc * qc.transpose();
        src_var += pc.norm_squared();
    }
    if src_var <= f64::EPSILON {
        return None;
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let mut v_t = svd.v_t?;
    let mut singular = svd.singular_values;

    let mut r = v_t.transpose() * u.transpose();
    if r.determinant() < 0.0 {
        // Reflection: flip the axis of the smallest singular value
        v_t[(1, 0)] = -v_t[(1, 0)];
        v_t[(1, 1)] = -v_t[(1, 1)];
        singular[1] = -singular[1];
        r = v_t.transpose() * u.transpose();
    }

    let scale = if allow_scale {
        (singular[0] + singular[1]) / src_var
    } else {
        1.0
    };
    let t = dst_centroid - scale * (r * src_centroid);
    Some(GeometricTransform::from_matrix(&r, scale, t))
}
