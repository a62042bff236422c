//! The stacking run: classify, master, calibrate, register, drizzle with
//! rejection, reconstruct and compose.
//!
//! Frames are streamed. The preparation pass keeps only star lists and
//! per-plane statistics; the drizzle passes reload and recalibrate each frame,
//! so memory stays bounded by the output grid rather than the frame count.

use crate::classify::{skip_detail, FrameClassifier, FrameRef};
use crate::config::{DrizzleParams, FilterMode, PipelineConfig, SigmaThresholds};
use crate::drizzle::{AccumulationBuffer, DrizzleGrid};
use crate::error::{FrameSkip, Result, SkipReason, Stage, StackError};
use crate::frame::{cfa_position, FrameKind, RasterFrame, SensorGeometry};
use crate::master::{Calibration, CalibrationMaster};
use crate::output::{Artifact, OutputComposer, StackSummary};
use crate::reconstruct::ChannelReconstructor;
use crate::registration::{GeometricTransform, Registrar};
use crate::rejection::SigmaRejector;
use crate::stars::{detect_frame_stars, Star, StarDetectionParams};
use crate::statistics::median_sigma;
use crate::store::RasterStore;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// No-data fraction of the composite above which a warning is raised
const LOW_COVERAGE_FRACTION: f64 = 0.05;

/// Shared flag for abandoning a run between frames.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    /// Abandoned; no composite was written
    Cancelled,
}

/// Degraded-mode conditions. The run still produced a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    NoCalibrationFrames,
    InsufficientFramesForUpscale { frames: usize, recommended: usize },
    FramesExcluded { excluded: usize, remaining: usize },
    LowCoverage { no_data_fraction: f64 },
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::NoCalibrationFrames => {
                write!(f, "no calibration frames found, lights are stacked uncalibrated")
            }
            RunWarning::InsufficientFramesForUpscale {
                frames,
                recommended,
            } => write!(
                f,
                "insufficient frames for 2x: {} stacked, {} recommended; coverage gaps likely",
                frames, recommended
            ),
            RunWarning::FramesExcluded {
                excluded,
                remaining,
            } => write!(f, "{} light frame(s) excluded, {} stacked", excluded, remaining),
            RunWarning::LowCoverage { no_data_fraction } => write!(
                f,
                "{:.1}% of the composite has no data",
                no_data_fraction * 100.0
            ),
        }
    }
}

/// Per-frame outcome of an accepted light.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub path: PathBuf,
    pub stars: usize,
    pub transform: GeometricTransform,
    pub rotation_degrees: f64,
    pub matched: usize,
    pub rms: f64,
    pub accepted_contributions: u64,
    pub rejected_contributions: u64,
}

/// Everything the caller needs about a run; also written as `report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub root: PathBuf,
    pub output_dir: PathBuf,
    pub filter: FilterMode,
    pub drizzle: DrizzleParams,
    pub sigma: SigmaThresholds,
    pub lights_found: usize,
    pub darks_found: usize,
    pub darks_used: usize,
    pub defect_pixels: usize,
    pub reference: Option<PathBuf>,
    pub frames_stacked: usize,
    /// Seconds of integration in the composite
    pub livetime: f64,
    pub rejected_contributions: u64,
    pub frames: Vec<FrameRecord>,
    pub warnings: Vec<RunWarning>,
    pub skipped: Vec<FrameSkip>,
    pub artifacts: Vec<Artifact>,
}

impl RunReport {
    fn new(root: &Path, output_dir: &Path, config: &PipelineConfig, drizzle: DrizzleParams) -> Self {
        Self {
            status: RunStatus::Complete,
            root: root.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            filter: config.filter,
            drizzle,
            sigma: config.sigma(),
            lights_found: 0,
            darks_found: 0,
            darks_used: 0,
            defect_pixels: 0,
            reference: None,
            frames_stacked: 0,
            livetime: 0.0,
            rejected_contributions: 0,
            frames: Vec::new(),
            warnings: Vec::new(),
            skipped: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    fn warn(&mut self, warning: RunWarning) {
        tracing::warn!("{}", warning);
        self.warnings.push(warning);
    }

    pub fn has_warning(&self, matches: impl Fn(&RunWarning) -> bool) -> bool {
        self.warnings.iter().any(matches)
    }
}

/// Per-plane affine map onto the reference frame's background and noise.
#[derive(Debug, Clone, Copy)]
struct Normalization {
    gain: [f32; 4],
    offset: [f32; 4],
}

impl Normalization {
    const IDENTITY: Normalization = Normalization {
        gain: [1.0; 4],
        offset: [0.0; 4],
    };

    fn between(frame: &PlaneStats, reference: &PlaneStats) -> Self {
        let mut gain = [1.0f32; 4];
        let mut offset = [0.0f32; 4];
        for p in 0..4 {
            if frame.sigma[p] > 0.0 && reference.sigma[p] > 0.0 {
                gain[p] = reference.sigma[p] / frame.sigma[p];
            }
            offset[p] = reference.median[p] - frame.median[p] * gain[p];
        }
        Self { gain, offset }
    }

    fn apply(&self, frame: &mut RasterFrame) {
        let width = frame.width();
        for (i, v) in frame.data.iter_mut().enumerate() {
            let p = cfa_position(i % width, i / width);
            *v = *v * self.gain[p] + self.offset[p];
        }
    }
}

/// Median and MAD sigma of each CFA-position plane.
#[derive(Debug, Clone, Copy, Default)]
struct PlaneStats {
    median: [f32; 4],
    sigma: [f32; 4],
}

impl PlaneStats {
    fn of(frame: &RasterFrame) -> Self {
        let width = frame.width();
        let mut planes: [Vec<f32>; 4] = Default::default();
        for plane in planes.iter_mut() {
            plane.reserve(frame.data.len() / 4 + 1);
        }
        for (i, &v) in frame.data.iter().enumerate() {
            if v.is_finite() {
                planes[cfa_position(i % width, i / width)].push(v);
            }
        }
        let mut stats = PlaneStats::default();
        for (p, values) in planes.iter().enumerate() {
            if let Some((median, sigma)) = median_sigma(values) {
                stats.median[p] = median;
                stats.sigma[p] = sigma;
            }
        }
        stats
    }
}

/// What survives the preparation pass of one light.
#[derive(Debug, Clone)]
struct PreparedFrame {
    index: usize,
    path: PathBuf,
    geometry: SensorGeometry,
    exposure: Option<f64>,
    carried_headers: Vec<(String, String)>,
    stars: Vec<Star>,
    stats: PlaneStats,
}

#[derive(Debug, Clone)]
struct RegisteredFrame {
    prepared: PreparedFrame,
    transform: GeometricTransform,
    matched: usize,
    rms: f64,
    normalization: Normalization,
}

pub struct Pipeline<'a> {
    config: PipelineConfig,
    store: &'a dyn RasterStore,
    cancel: CancelToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: PipelineConfig, store: &'a dyn RasterStore) -> Self {
        Self {
            config,
            store,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the whole pipeline on `root`. Errors are run-level failures;
    /// per-frame problems end up in the report.
    pub fn run(&self, root: &Path) -> Result<RunReport> {
        match self.config.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| StackError::Config(format!("cannot start {} worker threads: {}", threads, e)))?;
                pool.install(|| self.run_stages(root))
            }
            None => self.run_stages(root),
        }
    }

    fn run_stages(&self, root: &Path) -> Result<RunReport> {
        let drizzle = self.config.validate()?;
        let output_dir = self.config.output_dir_for(root);
        let mut report = RunReport::new(root, &output_dir, &self.config, drizzle);

        tracing::info!(
            "Stacking {} ({} mode, {} kernel, scale {}, pixfrac {})",
            root.display(),
            self.config.filter,
            drizzle.kernel,
            drizzle.scale,
            drizzle.pixfrac
        );

        let classification = FrameClassifier::new()
            .excluding(output_dir.clone())
            .classify(root)?;
        report.lights_found = classification.lights.len();
        report.darks_found = classification.darks.len();
        report.skipped.extend(classification.skipped);
        if classification.lights.is_empty() {
            return Err(StackError::NoLightFrames(root.to_path_buf()));
        }

        let composer = OutputComposer::new(self.store, output_dir.clone(), self.config.export_tiff);
        composer.prepare()?;

        let calibration = self.build_calibration(&classification.darks, &mut report)?;
        if let Some(master) = calibration.master() {
            report.artifacts.push(composer.write_master(master)?);
        }
        if self.cancel.is_cancelled() {
            return self.cancelled(report, &composer);
        }

        let prepared = self.prepare_lights(&classification.lights, &calibration, &mut report);
        if self.cancel.is_cancelled() {
            return self.cancelled(report, &composer);
        }
        if prepared.is_empty() {
            return Err(StackError::NoUsableFrames {
                stage: Stage::Calibration,
                skipped: report.lights_found,
            });
        }

        let registered = self.register(prepared, &mut report);
        if self.cancel.is_cancelled() {
            return self.cancelled(report, &composer);
        }
        if registered.is_empty() {
            return Err(StackError::NoUsableFrames {
                stage: Stage::Registration,
                skipped: report.lights_found,
            });
        }

        let excluded = report.lights_found - registered.len();
        if excluded > 0 {
            report.warn(RunWarning::FramesExcluded {
                excluded,
                remaining: registered.len(),
            });
        }
        if drizzle.scale > 1.0 && registered.len() < self.config.upscale_min_frames {
            report.warn(RunWarning::InsufficientFramesForUpscale {
                frames: registered.len(),
                recommended: self.config.upscale_min_frames,
            });
        }

        let geometry = registered[0].prepared.geometry;
        let grid = DrizzleGrid::new(drizzle, geometry.width, geometry.height);
        let carried_headers = registered[0].prepared.carried_headers.clone();

        let (registered, rejector) = self.observe_pass(&grid, registered, &calibration, &mut report);
        if self.cancel.is_cancelled() {
            return self.cancelled(report, &composer);
        }

        let mut buffer = AccumulationBuffer::new(&grid);
        let completed = self.accumulate_pass(
            &grid,
            &registered,
            &calibration,
            rejector.as_ref(),
            &mut buffer,
            &mut report,
        );

        let summary = StackSummary {
            frames: report.frames_stacked,
            livetime: report.livetime,
            drizzle,
            filter: self.config.filter,
            complete: completed,
            carried_headers,
        };
        let planes = buffer.finalize(geometry.cfa);

        if !completed {
            if self.config.keep_intermediates {
                let partial = composer.write_intermediates(&planes, &summary)?;
                report.artifacts.extend(partial);
            }
            return self.cancelled(report, &composer);
        }
        if report.frames_stacked == 0 {
            return Err(StackError::NoUsableFrames {
                stage: Stage::Accumulation,
                skipped: report.lights_found,
            });
        }

        let reconstruction = ChannelReconstructor::new(self.config.filter).reconstruct(&planes);

        if self.config.keep_intermediates {
            let intermediates = composer.write_intermediates(&planes, &summary)?;
            report.artifacts.extend(intermediates);
        } else {
            composer.clean_intermediates()?;
        }
        drop(planes);

        let (artifacts, image) = composer.write_composite(&reconstruction, &summary)?;
        report.artifacts.extend(artifacts);

        let no_data_fraction = image.no_data as f64 / (image.width * image.height).max(1) as f64;
        if no_data_fraction > LOW_COVERAGE_FRACTION {
            report.warn(RunWarning::LowCoverage { no_data_fraction });
        }

        let report_artifact = composer.write_report(&report)?;
        report.artifacts.push(report_artifact);

        tracing::info!(
            "Stacked {} of {} light frame(s), {:.0}s integration, {} warning(s), {} skip(s)",
            report.frames_stacked,
            report.lights_found,
            report.livetime,
            report.warnings.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    fn cancelled(&self, mut report: RunReport, composer: &OutputComposer) -> Result<RunReport> {
        tracing::warn!("Run cancelled, no composite written");
        report.status = RunStatus::Cancelled;
        let artifact = composer.write_report(&report)?;
        report.artifacts.push(artifact);
        Ok(report)
    }

    /// Load the darks and combine them. Without usable darks calibration
    /// degrades to a passthrough.
    fn build_calibration(&self, darks: &[FrameRef], report: &mut RunReport) -> Result<Calibration> {
        let loaded: Vec<std::result::Result<RasterFrame, FrameSkip>> = darks
            .par_iter()
            .map(|dark| {
                self.store.load(&dark.path, FrameKind::Dark).map_err(|e| {
                    FrameSkip::new(
                        &dark.path,
                        Stage::Mastering,
                        SkipReason::Unreadable {
                            detail: skip_detail(&e),
                        },
                    )
                })
            })
            .collect();

        let mut frames: Vec<RasterFrame> = Vec::with_capacity(loaded.len());
        for result in loaded {
            let frame = match result {
                Ok(frame) => frame,
                Err(skip) => {
                    report.skipped.push(skip);
                    continue;
                }
            };
            let expected = frames
                .first()
                .filter(|first| !first.geometry.same_framing(&frame.geometry))
                .map(|first| (first.width(), first.height()));
            match expected {
                Some(expected) => report.skipped.push(FrameSkip::new(
                    &frame.path,
                    Stage::Mastering,
                    SkipReason::GeometryMismatch {
                        expected,
                        found: (frame.width(), frame.height()),
                    },
                )),
                None => frames.push(frame),
            }
        }

        if frames.is_empty() {
            report.warn(RunWarning::NoCalibrationFrames);
            return Ok(Calibration::Passthrough);
        }

        let master = CalibrationMaster::from_darks(&frames, self.config.sigma(), &self.config.defects)?;
        report.darks_used = master.frame_count;
        report.defect_pixels = master.defects.len();
        Ok(Calibration::Master(Box::new(master)))
    }

    fn load_light(
        &self,
        path: &Path,
        calibration: &Calibration,
        stage: Stage,
    ) -> std::result::Result<RasterFrame, FrameSkip> {
        let frame = self.store.load(path, FrameKind::Light).map_err(|e| {
            FrameSkip::new(
                path,
                stage,
                SkipReason::Unreadable {
                    detail: skip_detail(&e),
                },
            )
        })?;
        calibration
            .calibrate(frame)
            .map_err(|reason| FrameSkip::new(path, stage, reason))
    }

    /// Calibrate every light once to find its stars and plane statistics.
    fn prepare_lights(
        &self,
        lights: &[FrameRef],
        calibration: &Calibration,
        report: &mut RunReport,
    ) -> Vec<PreparedFrame> {
        let star_params = StarDetectionParams {
            detection_sigma: self.config.registration.detection_sigma,
            max_stars: self.config.registration.max_stars,
            ..Default::default()
        };

        let results: Vec<Option<std::result::Result<PreparedFrame, FrameSkip>>> = lights
            .par_iter()
            .enumerate()
            .map(|(index, light)| {
                if self.cancel.is_cancelled() {
                    return None;
                }
                let result = self
                    .load_light(&light.path, calibration, Stage::Calibration)
                    .map(|frame| {
                        let detection = detect_frame_stars(&frame, &star_params);
                        tracing::debug!(
                            "{}: {} star(s)",
                            light.path.display(),
                            detection.stars.len()
                        );
                        PreparedFrame {
                            index,
                            path: light.path.clone(),
                            geometry: frame.geometry,
                            exposure: frame.exposure,
                            carried_headers: frame.carried_headers.clone(),
                            stars: detection.stars,
                            stats: PlaneStats::of(&frame),
                        }
                    });
                Some(result)
            })
            .collect();

        let mut prepared: Vec<PreparedFrame> = Vec::new();
        for result in results.into_iter().flatten() {
            let frame = match result {
                Ok(frame) => frame,
                Err(skip) => {
                    report.skipped.push(skip);
                    continue;
                }
            };
            let expected = prepared
                .first()
                .filter(|first| !first.geometry.same_framing(&frame.geometry))
                .map(|first| (first.geometry.width, first.geometry.height));
            match expected {
                Some(expected) => report.skipped.push(FrameSkip::new(
                    &frame.path,
                    Stage::Calibration,
                    SkipReason::GeometryMismatch {
                        expected,
                        found: (frame.geometry.width, frame.geometry.height),
                    },
                )),
                None => prepared.push(frame),
            }
        }
        tracing::info!("Prepared {} of {} light frame(s)", prepared.len(), lights.len());
        prepared
    }

    /// Pick the reference (most stars, first on ties) and register the rest.
    fn register(&self, prepared: Vec<PreparedFrame>, report: &mut RunReport) -> Vec<RegisteredFrame> {
        let mut reference_index = 0;
        for (i, frame) in prepared.iter().enumerate() {
            if frame.stars.len() > prepared[reference_index].stars.len() {
                reference_index = i;
            }
        }
        let reference = prepared[reference_index].clone();
        report.reference = Some(reference.path.clone());
        tracing::info!(
            "Reference frame {} with {} star(s)",
            reference.path.display(),
            reference.stars.len()
        );

        let registrar = Registrar::new(&reference.stars, &self.config.registration);
        let normalize = self.config.normalize_frames;

        let results: Vec<Option<std::result::Result<RegisteredFrame, FrameSkip>>> = prepared
            .into_par_iter()
            .map(|frame| {
                if self.cancel.is_cancelled() {
                    return None;
                }
                let normalization = if normalize {
                    Normalization::between(&frame.stats, &reference.stats)
                } else {
                    Normalization::IDENTITY
                };
                if frame.index == reference.index {
                    return Some(Ok(RegisteredFrame {
                        transform: GeometricTransform::identity(),
                        matched: frame.stars.len(),
                        rms: 0.0,
                        normalization: Normalization::IDENTITY,
                        prepared: frame,
                    }));
                }
                let result = match registrar.register(&frame.stars, frame.index as u64) {
                    Ok(registration) => {
                        tracing::debug!(
                            "{}: rotation {:.3} deg, shift ({:.2}, {:.2}), {} matched, rms {:.3}",
                            frame.path.display(),
                            registration.transform.rotation_degrees(),
                            registration.transform.tx,
                            registration.transform.ty,
                            registration.matched,
                            registration.rms
                        );
                        Ok(RegisteredFrame {
                            transform: registration.transform,
                            matched: registration.matched,
                            rms: registration.rms,
                            normalization,
                            prepared: frame,
                        })
                    }
                    Err(reason) => Err(FrameSkip::new(&frame.path, Stage::Registration, reason)),
                };
                Some(result)
            })
            .collect();

        let mut registered = Vec::new();
        for result in results.into_iter().flatten() {
            match result {
                Ok(frame) => registered.push(frame),
                Err(skip) => report.skipped.push(skip),
            }
        }
        tracing::info!("Registered {} frame(s)", registered.len());
        registered
    }

    /// Reload a registered frame in calibrated, normalized form.
    fn reload(
        &self,
        frame: &RegisteredFrame,
        calibration: &Calibration,
    ) -> std::result::Result<RasterFrame, FrameSkip> {
        let mut data = self.load_light(&frame.prepared.path, calibration, Stage::Accumulation)?;
        frame.normalization.apply(&mut data);
        Ok(data)
    }

    /// First drizzle pass gathering rejection statistics. Returns the frames
    /// that were observed; a frame failing to reload here is skipped once and
    /// never accumulated, so the statistics hold exactly the stacked frames.
    /// Without enough frames every frame is returned and rejection is off.
    fn observe_pass(
        &self,
        grid: &DrizzleGrid,
        frames: Vec<RegisteredFrame>,
        calibration: &Calibration,
        report: &mut RunReport,
    ) -> (Vec<RegisteredFrame>, Option<SigmaRejector>) {
        let min_samples = self.config.rejection_min_samples;
        if frames.len() <= min_samples {
            tracing::info!(
                "Sigma rejection disabled: needs at least {} frames, found {}",
                min_samples + 1,
                frames.len()
            );
            return (frames, None);
        }

        let total = frames.len();
        let mut rejector = SigmaRejector::new(grid, self.config.sigma(), min_samples);
        let mut observed = Vec::with_capacity(total);
        for (n, frame) in frames.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return (observed, None);
            }
            match self.reload(&frame, calibration) {
                Ok(data) => {
                    rejector.observe(grid, &data, &frame.transform);
                    tracing::debug!("[{}/{}] Observed {}", n + 1, total, frame.prepared.path.display());
                    observed.push(frame);
                }
                Err(skip) => report.skipped.push(skip),
            }
        }

        if observed.len() <= min_samples {
            tracing::info!(
                "Sigma rejection disabled: needs at least {} frames, {} reloaded",
                min_samples + 1,
                observed.len()
            );
            return (observed, None);
        }
        tracing::info!("Rejection statistics gathered from {} frame(s)", rejector.frames());
        (observed, Some(rejector))
    }

    /// Second pass: drizzle every frame into the buffer. Returns false when
    /// cancelled part way.
    fn accumulate_pass(
        &self,
        grid: &DrizzleGrid,
        frames: &[RegisteredFrame],
        calibration: &Calibration,
        rejector: Option<&SigmaRejector>,
        buffer: &mut AccumulationBuffer,
        report: &mut RunReport,
    ) -> bool {
        for (n, frame) in frames.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return false;
            }
            let data = match self.reload(frame, calibration) {
                Ok(data) => data,
                Err(skip) => {
                    report.skipped.push(skip);
                    continue;
                }
            };
            let contribution = buffer.accumulate(grid, &data, &frame.transform, rejector);
            tracing::info!(
                "[{}/{}] Drizzled {} ({} contribution(s) rejected)",
                n + 1,
                frames.len(),
                frame.prepared.path.display(),
                contribution.rejected
            );

            report.frames_stacked += 1;
            report.livetime += frame.prepared.exposure.unwrap_or(0.0);
            report.rejected_contributions += contribution.rejected;
            report.frames.push(FrameRecord {
                path: frame.prepared.path.clone(),
                stars: frame.prepared.stars.len(),
                transform: frame.transform,
                rotation_degrees: frame.transform.rotation_degrees(),
                matched: frame.matched,
                rms: frame.rms,
                accepted_contributions: contribution.accepted,
                rejected_contributions: contribution.rejected,
            });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_normalization_matches_background_and_noise() {
        let reference = PlaneStats {
            median: [100.0; 4],
            sigma: [5.0; 4],
        };
        let frame = PlaneStats {
            median: [150.0, 150.0, 150.0, 120.0],
            sigma: [10.0, 10.0, 10.0, 0.0],
        };
        let n = Normalization::between(&frame, &reference);
        // median maps onto median, one sigma onto one sigma
        assert!((150.0 * n.gain[0] + n.offset[0] - 100.0).abs() < 1e-4);
        assert!((160.0 * n.gain[0] + n.offset[0] - 105.0).abs() < 1e-4);
        // A flat plane only gets shifted
        assert_eq!(n.gain[3], 1.0);
        assert_eq!(n.offset[3], -20.0);
    }

    #[test]
    fn test_plane_stats_split_by_cfa_position() {
        let data = (0..16)
            .map(|i| if cfa_position(i % 4, i / 4) == 0 { 50.0 } else { 10.0 })
            .collect();
        let frame = RasterFrame::synthetic("s", 4, 4, data);
        let stats = PlaneStats::of(&frame);
        assert_eq!(stats.median[0], 50.0);
        assert_eq!(stats.median[3], 10.0);
        assert_eq!(stats.sigma[0], 0.0);
    }

    #[test]
    fn test_warning_messages() {
        let warning = RunWarning::InsufficientFramesForUpscale {
            frames: 10,
            recommended: 50,
        };
        assert!(warning.to_string().contains("coverage gaps likely"));
        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["kind"], "insufficient_frames_for_upscale");
    }
}
