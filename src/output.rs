//! Persisted artifacts of a run: composite(s), master dark, intermediates
//! and the JSON report.

use crate::config::{DrizzleParams, FilterMode};
use crate::drizzle::FinalizedPlanes;
use crate::error::{Result, StackError};
use crate::fits::{is_carried_key, Card};
use crate::master::CalibrationMaster;
use crate::reconstruct::{Band, Channel, Reconstruction};
use crate::store::RasterStore;
use image::{ImageBuffer, Luma, Rgb};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const MASTER_DARK_NAME: &str = "master_dark.fit";
pub const REPORT_NAME: &str = "report.json";
pub const PROCESS_DIR: &str = "process";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Composite,
    MasterDark,
    Intermediate,
    Tiff,
    Report,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

impl Artifact {
    fn new(kind: ArtifactKind, path: PathBuf) -> Self {
        tracing::info!("Wrote {}", path.display());
        Self { kind, path }
    }
}

/// What went into a stack, for output headers.
#[derive(Debug, Clone)]
pub struct StackSummary {
    pub frames: usize,
    /// Summed exposure of the accumulated frames, seconds
    pub livetime: f64,
    pub drizzle: DrizzleParams,
    pub filter: FilterMode,
    pub complete: bool,
    pub carried_headers: Vec<(String, String)>,
}

/// Channels rescaled to a common [0, 1] range.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub width: usize,
    pub height: usize,
    pub bands: Vec<Band>,
    pub planes: Vec<Vec<f32>>,
    /// Pixels where at least one channel has no data
    pub no_data: usize,
    /// Linear range mapped onto [0, 1]
    pub range: (f32, f32),
}

impl NormalizedImage {
    fn plane(&self, band: Band) -> Option<&[f32]> {
        self.bands
            .iter()
            .position(|&b| b == band)
            .map(|i| self.planes[i].as_slice())
    }
}

/// Common linear rescale of all channels. The range is taken over covered
/// pixels only; uncovered pixels are NaN, the blank value of float FITS.
pub fn normalize_channels(channels: &[Channel], width: usize, height: usize) -> NormalizedImage {
    let n = width * height;
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for channel in channels {
        for v in (0..n).filter_map(|i| channel.get(i)) {
            lo = lo.min(v);
            hi = hi.max(v);
        }
    }
    if !lo.is_finite() || !hi.is_finite() {
        lo = 0.0;
        hi = 0.0;
    }
    let span = if hi > lo { hi - lo } else { 1.0 };

    let planes = channels
        .iter()
        .map(|channel| {
            (0..n)
                .map(|i| channel.get(i).map_or(f32::NAN, |v| (v - lo) / span))
                .collect()
        })
        .collect();
    let no_data = (0..n)
        .filter(|&i| channels.iter().any(|c| c.get(i).is_none()))
        .count();

    NormalizedImage {
        width,
        height,
        bands: channels.iter().map(|c| c.band).collect(),
        planes,
        no_data,
        range: (lo, hi),
    }
}

/// Integration time as used in artifact names, e.g. `1230s`.
pub fn livetime_label(seconds: f64) -> String {
    format!("{:.0}s", seconds.max(0.0))
}

pub struct OutputComposer<'a> {
    store: &'a dyn RasterStore,
    dir: PathBuf,
    export_tiff: bool,
}

impl<'a> OutputComposer<'a> {
    pub fn new(store: &'a dyn RasterStore, dir: impl Into<PathBuf>, export_tiff: bool) -> Self {
        Self {
            store,
            dir: dir.into(),
            export_tiff,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn write_master(&self, master: &CalibrationMaster) -> Result<Artifact> {
        let path = self.dir.join(MASTER_DARK_NAME);
        let mut cards = vec![
            ("IMAGETYP".to_string(), Card::Text("MASTER DARK".to_string())),
            ("NCOMBINE".to_string(), Card::Int(master.frame_count as i32)),
            ("BAYERPAT".to_string(), Card::Text(master.geometry.cfa.name().to_string())),
            ("NHOTPIX".to_string(), Card::Int(master.defects.hot_count() as i32)),
            ("NCOLDPIX".to_string(), Card::Int(master.defects.cold_count() as i32)),
        ];
        if let Some(exposure) = master.exposure {
            cards.push(("EXPTIME".to_string(), Card::Float(exposure)));
        }
        append_carried(&mut cards, &master.carried_headers);

        self.store.save_mono(
            &path,
            master.geometry.width,
            master.geometry.height,
            &master.data,
            &cards,
        )?;
        Ok(Artifact::new(ArtifactKind::MasterDark, path))
    }

    /// Write the normalized composite(s) for the reconstruction's filter mode.
    pub fn write_composite(
        &self,
        recon: &Reconstruction,
        summary: &StackSummary,
    ) -> Result<(Vec<Artifact>, NormalizedImage)> {
        let image = normalize_channels(&recon.channels, recon.width, recon.height);
        let cards = composite_cards(summary, image.no_data);
        let label = livetime_label(summary.livetime);
        let (w, h) = (recon.width, recon.height);
        let mut artifacts = Vec::new();

        let missing = |band: Band| {
            StackError::Config(format!("{} channel missing from {} reconstruction", band, recon.mode))
        };

        match recon.mode {
            FilterMode::Standard => {
                let r = image.plane(Band::Red).ok_or_else(|| missing(Band::Red))?;
                let g = image.plane(Band::Green).ok_or_else(|| missing(Band::Green))?;
                let b = image.plane(Band::Blue).ok_or_else(|| missing(Band::Blue))?;
                let path = self.dir.join(format!("result_{}.fit", label));
                self.store.save_rgb(&path, w, h, [r, g, b], &cards)?;
                artifacts.push(Artifact::new(ArtifactKind::Composite, path.clone()));
                if self.export_tiff {
                    artifacts.push(write_rgb_tiff(&path.with_extension("tif"), w, h, [r, g, b])?);
                }
            }
            FilterMode::DualBand => {
                let ha = image.plane(Band::Ha).ok_or_else(|| missing(Band::Ha))?;
                let oiii = image.plane(Band::Oiii).ok_or_else(|| missing(Band::Oiii))?;
                artifacts.push(self.write_band(Band::Ha, ha, w, h, &label, &cards)?);
                artifacts.push(self.write_band(Band::Oiii, oiii, w, h, &label, &cards)?);

                let path = self.dir.join(format!("HOO_result_{}.fit", label));
                self.store.save_rgb(&path, w, h, [ha, oiii, oiii], &cards)?;
                artifacts.push(Artifact::new(ArtifactKind::Composite, path.clone()));
                if self.export_tiff {
                    artifacts.push(write_rgb_tiff(&path.with_extension("tif"), w, h, [ha, oiii, oiii])?);
                }
            }
            FilterMode::NarrowbandHa | FilterMode::NarrowbandOiii => {
                let band = if recon.mode == FilterMode::NarrowbandHa {
                    Band::Ha
                } else {
                    Band::Oiii
                };
                let plane = image.plane(band).ok_or_else(|| missing(band))?;
                let artifact = self.write_band(band, plane, w, h, &label, &cards)?;
                if self.export_tiff {
                    let tiff = write_mono_tiff(&artifact.path.with_extension("tif"), w, h, plane)?;
                    artifacts.push(artifact);
                    artifacts.push(tiff);
                } else {
                    artifacts.push(artifact);
                }
            }
        }

        Ok((artifacts, image))
    }

    fn write_band(
        &self,
        band: Band,
        plane: &[f32],
        width: usize,
        height: usize,
        label: &str,
        cards: &[(String, Card)],
    ) -> Result<Artifact> {
        let path = self.dir.join(format!("{}_result_{}.fit", band.name(), label));
        let mut cards = cards.to_vec();
        cards.push(("BAND".to_string(), Card::Text(band.name().to_string())));
        self.store.save_mono(&path, width, height, plane, &cards)?;
        Ok(Artifact::new(ArtifactKind::Composite, path))
    }

    /// Per-CFA-position value and weight maps under `process/`.
    pub fn write_intermediates(
        &self,
        planes: &FinalizedPlanes,
        summary: &StackSummary,
    ) -> Result<Vec<Artifact>> {
        let dir = self.dir.join(PROCESS_DIR);
        std::fs::create_dir_all(&dir)?;
        let colors = planes.cfa.colors();
        let mut artifacts = Vec::new();

        for (position, plane) in planes.planes().iter().enumerate() {
            let mut cards = composite_cards(summary, 0);
            cards.retain(|(k, _)| k != "NODATA");
            cards.push(("CFAPOS".to_string(), Card::Int(position as i32)));

            let stem = format!("plane{}_{:?}", position, colors[position]).to_lowercase();
            for (suffix, data) in [("value", plane.values()), ("weight", plane.weights())] {
                let path = dir.join(format!("{}_{}.fit", stem, suffix));
                self.store
                    .save_mono(&path, planes.width, planes.height, data, &cards)?;
                artifacts.push(Artifact::new(ArtifactKind::Intermediate, path));
            }
        }
        Ok(artifacts)
    }

    /// Remove intermediates left by an earlier run. Returns files removed.
    pub fn clean_intermediates(&self) -> Result<usize> {
        let dir = self.dir.join(PROCESS_DIR);
        if !dir.is_dir() {
            return Ok(0);
        }
        let removed = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .count();
        std::fs::remove_dir_all(&dir)?;
        tracing::info!("Removed {} stale intermediate file(s) from {}", removed, dir.display());
        Ok(removed)
    }

    pub fn write_report<T: Serialize>(&self, report: &T) -> Result<Artifact> {
        let path = self.dir.join(REPORT_NAME);
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| StackError::raster(&path, format!("failed to serialize report: {}", e)))?;
        std::fs::write(&path, json)?;
        Ok(Artifact::new(ArtifactKind::Report, path))
    }
}

fn composite_cards(summary: &StackSummary, no_data: usize) -> Vec<(String, Card)> {
    let status = if summary.complete { "COMPLETE" } else { "INCOMPLETE" };
    let mut cards = vec![
        ("NCOMBINE".to_string(), Card::Int(summary.frames as i32)),
        ("LIVETIME".to_string(), Card::Float(summary.livetime)),
        ("EXPTIME".to_string(), Card::Float(summary.livetime)),
        ("DRZKERN".to_string(), Card::Text(summary.drizzle.kernel.name().to_string())),
        ("DRZSCALE".to_string(), Card::Float(summary.drizzle.scale)),
        ("DRZPIXF".to_string(), Card::Float(summary.drizzle.pixfrac)),
        ("FILTMODE".to_string(), Card::Text(summary.filter.name().to_string())),
        ("NODATA".to_string(), Card::Int(no_data as i32)),
        ("STACKSTA".to_string(), Card::Text(status.to_string())),
    ];
    append_carried(&mut cards, &summary.carried_headers);
    cards
}

/// Append descriptive input cards that the tool does not write itself.
fn append_carried(cards: &mut Vec<(String, Card)>, carried: &[(String, String)]) {
    for (key, value) in carried {
        if !is_carried_key(key) || cards.iter().any(|(k, _)| k == key) {
            continue;
        }
        let card = if let Ok(v) = value.parse::<i32>() {
            Card::Int(v)
        } else if let Ok(v) = value.parse::<f64>() {
            Card::Float(v)
        } else {
            Card::Text(value.clone())
        };
        cards.push((key.clone(), card));
    }
}

/// TIFF has no blank value, so no-data becomes black.
#[inline]
fn to_u16(v: f32) -> u16 {
    if v.is_nan() {
        return 0;
    }
    (v.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16
}

fn write_rgb_tiff(path: &Path, width: usize, height: usize, planes: [&[f32]; 3]) -> Result<Artifact> {
    let mut data = Vec::with_capacity(width * height * 3);
    for i in 0..width * height {
        for plane in &planes {
            data.push(to_u16(plane[i]));
        }
    }
    let buffer = ImageBuffer::<Rgb<u16>, Vec<u16>>::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| StackError::raster(path, "image buffer size mismatch"))?;
    buffer
        .save(path)
        .map_err(|e| StackError::raster(path, format!("failed to save TIFF: {}", e)))?;
    Ok(Artifact::new(ArtifactKind::Tiff, path.to_path_buf()))
}

fn write_mono_tiff(path: &Path, width: usize, height: usize, plane: &[f32]) -> Result<Artifact> {
    let data: Vec<u16> = plane.iter().map(|&v| to_u16(v)).collect();
    let buffer = ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| StackError::raster(path, "image buffer size mismatch"))?;
    buffer
        .save(path)
        .map_err(|e| StackError::raster(path, format!("failed to save TIFF: {}", e)))?;
    Ok(Artifact::new(ArtifactKind::Tiff, path.to_path_buf()))
}
