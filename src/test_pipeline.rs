// End-to-end runs over synthetic sessions written as FITS files.
//
// Every session shares one sky: a jittered grid of Gaussian stars of
// distinct brightness. Each light sees it through a small field rotation
// plus a dither offset, the way an alt-az mount drifts during a night.

#[cfg(test)]
mod tests {
    use crate::config::{FilterMode, PipelineConfig, StackingMethod};
    use crate::error::StackError;
    use crate::fits::{read_fits_metadata, write_f32_image, Card};
    use crate::output::ArtifactKind;
    use crate::pipeline::{CancelToken, Pipeline, RunStatus, RunWarning};
    use crate::registration::GeometricTransform;
    use crate::frame::{FrameKind, RasterFrame};
    use crate::store::{FitsStore, RasterStore};
    use rand::prelude::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    const SIZE: usize = 128;
    const EXPOSURE: f64 = 10.0;
    const DARK_LEVEL: f32 = 50.0;
    const HOT_PIXEL: (usize, usize) = (40, 41);
    const TRAIL_ROW: usize = 60;

    struct Session {
        lights: usize,
        darks: usize,
        /// Light index that gets a satellite trail
        trail: Option<usize>,
    }

    fn sky_stars() -> Vec<(f64, f64, f64)> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut stars = Vec::new();
        for gy in 0..4 {
            for gx in 0..4 {
                let x = 22.0 + gx as f64 * 27.0 + rng.gen_range(-4.0..4.0);
                let y = 22.0 + gy as f64 * 27.0 + rng.gen_range(-4.0..4.0);
                let amplitude = 1500.0 + 250.0 * stars.len() as f64;
                stars.push((x, y, amplitude));
            }
        }
        stars
    }

    /// Frame pixel -> sky for light `k`: rotation about the center plus dither.
    fn frame_to_sky(k: usize) -> GeometricTransform {
        let rotation = (k as f64 * 0.1).to_radians();
        let dx = ((k * 7) % 5) as f64 * 0.7 - 1.4;
        let dy = ((k * 3) % 5) as f64 * 0.6 - 1.2;
        let c = SIZE as f64 / 2.0;
        let (rx, ry) = GeometricTransform::new(rotation, 1.0, 0.0, 0.0).apply(c, c);
        GeometricTransform::new(rotation, 1.0, c - rx + dx, c - ry + dy)
    }

    fn background(x: usize, y: usize) -> f32 {
        // R, G, G, B sites of an RGGB mosaic
        [520.0, 500.0, 500.0, 480.0][crate::frame::cfa_position(x, y)]
    }

    fn render_light(k: usize, stars: &[(f64, f64, f64)], with_dark: bool, trail: bool) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(1000 + k as u64);
        let to_sky = frame_to_sky(k);
        let mut data = vec![0f32; SIZE * SIZE];
        for y in 0..SIZE {
            for x in 0..SIZE {
                let (sx, sy) = to_sky.apply(x as f64, y as f64);
                let mut value = background(x, y) as f64 + rng.gen_range(-5.0..5.0);
                for &(cx, cy, amplitude) in stars {
                    let r2 = (sx - cx).powi(2) + (sy - cy).powi(2);
                    if r2 < 100.0 {
                        value += amplitude * (-r2 / (2.0 * 1.5 * 1.5)).exp();
                    }
                }
                data[y * SIZE + x] = value as f32;
            }
        }
        if with_dark {
            add_dark_signal(&mut data);
        }
        if trail {
            for x in 0..SIZE {
                data[TRAIL_ROW * SIZE + x] += 5000.0;
            }
        }
        data
    }

    fn add_dark_signal(data: &mut [f32]) {
        for v in data.iter_mut() {
            *v += DARK_LEVEL;
        }
        data[HOT_PIXEL.1 * SIZE + HOT_PIXEL.0] += 2000.0;
    }

    fn render_dark(k: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(5000 + k as u64);
        let mut data: Vec<f32> = (0..SIZE * SIZE).map(|_| rng.gen_range(-5.0..5.0)).collect();
        add_dark_signal(&mut data);
        data
    }

    fn write_frame(path: &Path, data: Vec<f32>, image_type: &str, k: usize) {
        let cards = vec![
            ("BAYERPAT".to_string(), Card::Text("RGGB".to_string())),
            ("EXPTIME".to_string(), Card::Float(EXPOSURE)),
            ("IMAGETYP".to_string(), Card::Text(image_type.to_string())),
            ("OBJECT".to_string(), Card::Text("NGC 7000".to_string())),
            (
                "DATE-OBS".to_string(),
                Card::Text(format!("2024-08-10T22:{:02}:{:02}", k / 6, (k % 6) * 10)),
            ),
        ];
        write_f32_image(path, &[SIZE, SIZE], data, &cards).unwrap();
    }

    /// Flat layout: `img-0001.fits` lights next to `img-0001-dark.fits` darks.
    fn write_session(root: &Path, session: &Session) {
        let stars = sky_stars();
        let with_dark = session.darks > 0;
        for k in 0..session.lights {
            let data = render_light(k, &stars, with_dark, session.trail == Some(k));
            write_frame(&root.join(format!("img-{:04}.fits", k + 1)), data, "LIGHT", k);
        }
        for k in 0..session.darks {
            write_frame(
                &root.join(format!("img-{:04}-dark.fits", k + 1)),
                render_dark(k),
                "DARK",
                k,
            );
        }
    }

    fn run(root: &Path, config: PipelineConfig) -> crate::pipeline::RunReport {
        let store = FitsStore::new(config.sensor.clone());
        Pipeline::new(config, &store).run(root).unwrap()
    }

    fn artifact_names(report: &crate::pipeline::RunReport, kind: ArtifactKind) -> Vec<String> {
        report
            .artifacts
            .iter()
            .filter(|a| a.kind == kind)
            .map(|a| a.path.file_name().unwrap().to_string_lossy().to_string())
            .collect()
    }

    fn output(root: &Path, name: &str) -> PathBuf {
        root.join("stacked").join(name)
    }

    #[test]
    fn test_scenario_a_full_rgb_with_darks() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            &Session {
                lights: 40,
                darks: 10,
                trail: Some(17),
            },
        );

        let config = PipelineConfig {
            filter: FilterMode::Standard,
            method: StackingMethod::BayerDrizzle,
            threads: Some(2),
            ..Default::default()
        };
        let report = run(dir.path(), config);

        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.lights_found, 40);
        assert_eq!(report.darks_used, 10);
        assert_eq!(report.frames_stacked, 40, "skipped: {:?}", report.skipped);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(report.defect_pixels >= 1);
        assert_eq!(report.livetime, 400.0);

        assert_eq!(artifact_names(&report, ArtifactKind::Composite), vec!["result_400s.fit"]);
        assert_eq!(artifact_names(&report, ArtifactKind::MasterDark), vec!["master_dark.fit"]);
        assert!(output(dir.path(), "report.json").exists());

        let composite = read_fits_metadata(&output(dir.path(), "result_400s.fit")).unwrap();
        assert_eq!(composite.get("NAXIS"), Some("3"));
        assert_eq!(composite.get("NAXIS3"), Some("3"));
        assert_eq!(composite.get_f64("NCOMBINE"), Some(40.0));
        assert_eq!(composite.get("DRZKERN"), Some("gaussian"));
        assert_eq!(composite.get("STACKSTA"), Some("COMPLETE"));
        assert_eq!(composite.get("OBJECT"), Some("NGC 7000"));

        // Registration recovers the field rotation between frames
        let reference = report.reference.clone().unwrap();
        let reference_index = report.frames.iter().position(|f| f.path == reference).unwrap();
        for (k, frame) in report.frames.iter().enumerate() {
            let expected = (k as f64 - reference_index as f64) * 0.1;
            assert!(
                (frame.rotation_degrees - expected).abs() < 0.1,
                "frame {}: rotation {} expected {}",
                k,
                frame.rotation_degrees,
                expected
            );
        }

        // The satellite trail is rejected, not stacked
        let trail = &report.frames[17];
        assert!(trail.rejected_contributions >= SIZE as u64, "{}", trail.rejected_contributions);
    }

    #[test]
    fn test_scenario_b_no_darks_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            &Session {
                lights: 5,
                darks: 0,
                trail: None,
            },
        );

        let report = run(dir.path(), PipelineConfig::default());

        assert_eq!(report.status, RunStatus::Complete);
        assert!(report.has_warning(|w| *w == RunWarning::NoCalibrationFrames));
        assert_eq!(report.frames_stacked, 5);
        assert_eq!(report.rejected_contributions, 0);
        assert!(artifact_names(&report, ArtifactKind::MasterDark).is_empty());
        assert!(!output(dir.path(), "master_dark.fit").exists());
        assert!(output(dir.path(), "result_50s.fit").exists());
    }

    #[test]
    fn test_scenario_c_dual_band_has_two_bands() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            &Session {
                lights: 30,
                darks: 3,
                trail: None,
            },
        );

        let config = PipelineConfig {
            filter: FilterMode::DualBand,
            ..Default::default()
        };
        let report = run(dir.path(), config);

        assert_eq!(report.frames_stacked, 30);
        assert_eq!(
            artifact_names(&report, ArtifactKind::Composite),
            vec!["Ha_result_300s.fit", "OIII_result_300s.fit", "HOO_result_300s.fit"]
        );
        let ha = read_fits_metadata(&output(dir.path(), "Ha_result_300s.fit")).unwrap();
        assert_eq!(ha.get("NAXIS"), Some("2"));
        assert_eq!(ha.get("FILTMODE"), Some("dual-band"));
        assert!(!output(dir.path(), "result_300s.fit").exists());
    }

    #[test]
    fn test_scenario_d_upscale_with_few_frames_warns() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            &Session {
                lights: 10,
                darks: 0,
                trail: None,
            },
        );

        let config = PipelineConfig {
            method: StackingMethod::Drizzle2x,
            ..Default::default()
        };
        let report = run(dir.path(), config);

        assert_eq!(report.status, RunStatus::Complete);
        assert!(report.has_warning(|w| matches!(
            w,
            RunWarning::InsufficientFramesForUpscale {
                frames: 10,
                recommended: 50
            }
        )));
        let composite = read_fits_metadata(&output(dir.path(), "result_100s.fit")).unwrap();
        assert_eq!(composite.get("NAXIS1"), Some("256"));
        assert_eq!(composite.get("NAXIS2"), Some("256"));
    }

    #[test]
    fn test_invalid_kernel_fails_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            method: StackingMethod::Drizzle2x,
            kernel: Some(crate::config::DrizzleKernel::Gaussian),
            ..Default::default()
        };
        let store = FitsStore::default();
        let err = Pipeline::new(config, &store).run(dir.path()).unwrap_err();
        assert!(matches!(err, StackError::Config(_)));
        assert!(!dir.path().join("stacked").exists());
    }

    #[test]
    fn test_fatal_inputs() {
        let store = FitsStore::default();
        let pipeline = Pipeline::new(PipelineConfig::default(), &store);

        let missing = pipeline.run(Path::new("/nonexistent/session")).unwrap_err();
        assert!(matches!(missing, StackError::RootInaccessible { .. }));

        let dir = tempfile::tempdir().unwrap();
        write_frame(&dir.path().join("only-dark.fits"), render_dark(0), "DARK", 0);
        let empty = pipeline.run(dir.path()).unwrap_err();
        assert!(matches!(empty, StackError::NoLightFrames(_)));
    }

    #[test]
    fn test_cancelled_run_writes_no_composite() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            &Session {
                lights: 4,
                darks: 2,
                trail: None,
            },
        );

        let token = CancelToken::new();
        token.cancel();
        let store = FitsStore::default();
        let report = Pipeline::new(PipelineConfig::default(), &store)
            .with_cancel_token(token)
            .run(dir.path())
            .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(artifact_names(&report, ArtifactKind::Composite).is_empty());
        // The master was finished before the cancellation point
        assert!(output(dir.path(), "master_dark.fit").exists());
        assert!(output(dir.path(), "report.json").exists());
    }

    /// FITS store that fails one path on the listed load attempts (1-based).
    struct FlakyStore {
        inner: FitsStore,
        path: PathBuf,
        failing: &'static [usize],
        loads: Mutex<usize>,
    }

    impl RasterStore for FlakyStore {
        fn load(&self, path: &Path, kind: FrameKind) -> crate::error::Result<RasterFrame> {
            if path == self.path {
                let mut loads = self.loads.lock().unwrap();
                *loads += 1;
                if self.failing.contains(&*loads) {
                    return Err(StackError::raster(path, "read error"));
                }
            }
            self.inner.load(path, kind)
        }

        fn save_mono(
            &self,
            path: &Path,
            width: usize,
            height: usize,
            data: &[f32],
            cards: &[(String, Card)],
        ) -> crate::error::Result<()> {
            self.inner.save_mono(path, width, height, data, cards)
        }

        fn save_rgb(
            &self,
            path: &Path,
            width: usize,
            height: usize,
            planes: [&[f32]; 3],
            cards: &[(String, Card)],
        ) -> crate::error::Result<()> {
            self.inner.save_rgb(path, width, height, planes, cards)
        }
    }

    #[test]
    fn test_frame_lost_between_passes_is_skipped_once() {
        // Load 1 finds stars, load 2 gathers rejection statistics, load 3 drizzles
        let cases: [&'static [usize]; 2] = [&[2], &[2, 3]];
        for failing in cases {
            let dir = tempfile::tempdir().unwrap();
            write_session(
                dir.path(),
                &Session {
                    lights: 8,
                    darks: 0,
                    trail: None,
                },
            );
            let flaky = dir.path().join("img-0003.fits");
            let config = PipelineConfig::default();
            let store = FlakyStore {
                inner: FitsStore::new(config.sensor.clone()),
                path: flaky.clone(),
                failing,
                loads: Mutex::new(0),
            };
            let report = Pipeline::new(config, &store).run(dir.path()).unwrap();

            assert_eq!(report.status, RunStatus::Complete);
            assert_eq!(report.frames_stacked, 7, "failing on {:?}", failing);
            assert!(report.frames.iter().all(|f| f.path != flaky));
            let skips = report.skipped.iter().filter(|s| s.path == flaky).count();
            assert_eq!(skips, 1, "failing on {:?}: {:?}", failing, report.skipped);
            assert_eq!(*store.loads.lock().unwrap(), 2);
        }
    }

    #[test]
    fn test_intermediates_kept_and_unreadable_frames_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_session(
            dir.path(),
            &Session {
                lights: 6,
                darks: 0,
                trail: None,
            },
        );
        std::fs::write(dir.path().join("img-0099.fits"), b"not a fits file").unwrap();
        std::fs::write(dir.path().join("preview.jpg"), b"jpeg").unwrap();

        let config = PipelineConfig {
            method: StackingMethod::BayerDrizzleSquare,
            keep_intermediates: true,
            ..Default::default()
        };
        let report = run(dir.path(), config);

        assert_eq!(report.frames_stacked, 6);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(artifact_names(&report, ArtifactKind::Intermediate).len(), 8);
        assert!(output(dir.path(), "process/plane0_red_value.fit").exists());

        // A second run without the flag cleans them up
        let report = run(dir.path(), PipelineConfig::default());
        assert_eq!(report.frames_stacked, 6);
        assert!(!output(dir.path(), "process").exists());
    }
}
