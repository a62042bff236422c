use crate::error::{Result, StackError};
use crate::frame::CfaPattern;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which channels the accumulated CFA planes are reconstructed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Broadband or light-pollution filter: full RGB
    #[default]
    Standard,
    /// Dual-band Ha/OIII filter: two mono bands read straight from CFA positions
    DualBand,
    NarrowbandHa,
    NarrowbandOiii,
}

impl FilterMode {
    pub fn name(self) -> &'static str {
        match self {
            FilterMode::Standard => "standard",
            FilterMode::DualBand => "dual-band",
            FilterMode::NarrowbandHa => "ha",
            FilterMode::NarrowbandOiii => "oiii",
        }
    }
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" | "rgb" | "broadband" => Ok(FilterMode::Standard),
            "dual-band" | "dualband" | "dual" => Ok(FilterMode::DualBand),
            "ha" | "narrowband-ha" => Ok(FilterMode::NarrowbandHa),
            "oiii" | "narrowband-oiii" => Ok(FilterMode::NarrowbandOiii),
            _ => Err(format!(
                "Invalid filter mode: {}. Use standard, dual-band, ha or oiii",
                s
            )),
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lower/upper rejection thresholds in standard deviations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SigmaThresholds {
    pub low: f64,
    pub high: f64,
}

/// Sky background quality (Bortle class). Noisier skies get tighter low
/// clipping so gradients are not mistaken for faint signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkyQuality {
    Bortle1To2,
    #[default]
    Bortle3To4,
    Bortle5To6,
    Bortle7To8,
}

impl SkyQuality {
    pub fn sigma(self) -> SigmaThresholds {
        let (low, high) = match self {
            SkyQuality::Bortle1To2 => (3.0, 3.0),
            SkyQuality::Bortle3To4 => (3.0, 3.0),
            SkyQuality::Bortle5To6 => (2.5, 3.0),
            SkyQuality::Bortle7To8 => (2.0, 2.5),
        };
        SigmaThresholds { low, high }
    }

    pub fn description(self) -> &'static str {
        match self {
            SkyQuality::Bortle1To2 => "Remote dark sites, minimal light pollution",
            SkyQuality::Bortle3To4 => "Rural areas, some light domes on horizon",
            SkyQuality::Bortle5To6 => "Suburban skies, noticeable light pollution",
            SkyQuality::Bortle7To8 => "City skies, heavy light pollution",
        }
    }
}

impl FromStr for SkyQuality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace(['_', ' '], "-").as_str() {
            "bortle1-2" | "bortle-1-2" | "excellent" | "1-2" => Ok(SkyQuality::Bortle1To2),
            "bortle3-4" | "bortle-3-4" | "rural" | "3-4" => Ok(SkyQuality::Bortle3To4),
            "bortle5-6" | "bortle-5-6" | "suburban" | "5-6" => Ok(SkyQuality::Bortle5To6),
            "bortle7-8" | "bortle-7-8" | "urban" | "7-8" => Ok(SkyQuality::Bortle7To8),
            _ => Err(format!(
                "Invalid sky quality: {}. Use bortle1-2, bortle3-4, bortle5-6 or bortle7-8",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrizzleKernel {
    /// Gaussian-weighted footprint; needs area interpolation at unit geometry
    Gaussian,
    /// Classic flux-preserving box footprint
    Square,
    /// Whole value to the output pixel under the mapped center
    Nearest,
}

impl DrizzleKernel {
    /// Kernels that interpolate fractional-pixel areas are only defined on
    /// an unscaled grid with the full pixel footprint.
    pub fn requires_unit_geometry(self) -> bool {
        matches!(self, DrizzleKernel::Gaussian)
    }

    pub fn name(self) -> &'static str {
        match self {
            DrizzleKernel::Gaussian => "gaussian",
            DrizzleKernel::Square => "square",
            DrizzleKernel::Nearest => "nearest",
        }
    }
}

impl FromStr for DrizzleKernel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gaussian" | "gauss" => Ok(DrizzleKernel::Gaussian),
            "square" | "box" => Ok(DrizzleKernel::Square),
            "nearest" | "point" => Ok(DrizzleKernel::Nearest),
            _ => Err(format!(
                "Invalid kernel: {}. Use gaussian, square or nearest",
                s
            )),
        }
    }
}

impl fmt::Display for DrizzleKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolved drizzle geometry for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrizzleParams {
    pub kernel: DrizzleKernel,
    pub scale: f64,
    pub pixfrac: f64,
}

impl DrizzleParams {
    pub fn validate(&self) -> Result<()> {
        if self.scale != 1.0 && self.scale != 2.0 {
            return Err(StackError::Config(format!(
                "drizzle scale must be 1.0 or 2.0, got {}",
                self.scale
            )));
        }
        if !(self.pixfrac > 0.0 && self.pixfrac <= 1.0) {
            return Err(StackError::Config(format!(
                "pixfrac must be in (0, 1], got {}",
                self.pixfrac
            )));
        }
        if self.kernel.requires_unit_geometry() && (self.scale != 1.0 || self.pixfrac != 1.0) {
            return Err(StackError::Config(format!(
                "the {} kernel interpolates fractional pixel areas and is only valid with \
                 scale=1.0 and pixfrac=1.0 (got scale={}, pixfrac={}); use the square kernel instead",
                self.kernel, self.scale, self.pixfrac
            )));
        }
        Ok(())
    }
}

/// Named stacking presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackingMethod {
    /// Gaussian kernel, best for field rotation
    #[default]
    BayerDrizzle,
    BayerDrizzleSquare,
    BayerDrizzleNearest,
    /// Doubles resolution; needs many well-dithered frames
    Drizzle2x,
}

impl StackingMethod {
    pub fn drizzle(self) -> DrizzleParams {
        let (kernel, scale) = match self {
            StackingMethod::BayerDrizzle => (DrizzleKernel::Gaussian, 1.0),
            StackingMethod::BayerDrizzleSquare => (DrizzleKernel::Square, 1.0),
            StackingMethod::BayerDrizzleNearest => (DrizzleKernel::Nearest, 1.0),
            StackingMethod::Drizzle2x => (DrizzleKernel::Square, 2.0),
        };
        DrizzleParams {
            kernel,
            scale,
            pixfrac: 1.0,
        }
    }
}

impl FromStr for StackingMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bayer-drizzle" | "gaussian" | "recommended" => Ok(StackingMethod::BayerDrizzle),
            "bayer-drizzle-square" | "square" => Ok(StackingMethod::BayerDrizzleSquare),
            "bayer-drizzle-nearest" | "nearest" => Ok(StackingMethod::BayerDrizzleNearest),
            "drizzle-2x" | "2x" | "upscale" => Ok(StackingMethod::Drizzle2x),
            _ => Err(format!(
                "Invalid stacking method: {}. Use bayer-drizzle, bayer-drizzle-square, \
                 bayer-drizzle-nearest or drizzle-2x",
                s
            )),
        }
    }
}

/// Fallback sensor description for frames whose headers lack it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorProfile {
    pub name: String,
    pub width: usize,
    pub height: usize,
    pub cfa: CfaPattern,
}

impl SensorProfile {
    /// Sony IMX676 as fitted to the Vespera Pro
    pub fn imx676() -> Self {
        Self {
            name: "Sony IMX676".to_string(),
            width: 3536,
            height: 3536,
            cfa: CfaPattern::Gbrg,
        }
    }

    /// Whether a frame has this sensor's full-frame geometry, the only
    /// case where its CFA pattern can be assumed safely.
    pub fn matches(&self, width: usize, height: usize) -> bool {
        self.width == width && self.height == height
    }
}

impl Default for SensorProfile {
    fn default() -> Self {
        Self::imx676()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationParams {
    /// Brightest stars kept per frame for matching
    pub max_stars: usize,
    /// Detection threshold in background sigmas
    pub detection_sigma: f64,
    /// Minimum inlier correspondences for a frame to be accepted
    pub min_matches: usize,
    /// Inlier tolerance in reference pixels
    pub match_tolerance: f64,
    pub ransac_iterations: usize,
    /// Also solve for a uniform scale (otherwise rotation + translation only)
    pub allow_scale: bool,
    pub seed: u64,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            max_stars: 40,
            detection_sigma: 5.0,
            min_matches: 6,
            match_tolerance: 1.5,
            ransac_iterations: 400,
            allow_scale: false,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefectParams {
    pub hot_sigma: f64,
    pub cold_sigma: f64,
}

impl Default for DefectParams {
    fn default() -> Self {
        Self {
            hot_sigma: 5.0,
            cold_sigma: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub filter: FilterMode,
    pub sky_quality: SkyQuality,
    pub method: StackingMethod,
    /// Overrides on top of the method preset
    pub kernel: Option<DrizzleKernel>,
    pub scale: Option<f64>,
    pub pixfrac: Option<f64>,
    pub keep_intermediates: bool,
    pub normalize_frames: bool,
    /// Defaults to `<root>/stacked`
    pub output_dir: Option<PathBuf>,
    pub export_tiff: bool,
    pub sensor: SensorProfile,
    pub registration: RegistrationParams,
    pub defects: DefectParams,
    /// Contributions from other frames needed before a pixel is eligible for rejection
    pub rejection_min_samples: usize,
    pub upscale_min_frames: usize,
    pub threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            filter: FilterMode::default(),
            sky_quality: SkyQuality::default(),
            method: StackingMethod::default(),
            kernel: None,
            scale: None,
            pixfrac: None,
            keep_intermediates: false,
            normalize_frames: true,
            output_dir: None,
            export_tiff: false,
            sensor: SensorProfile::default(),
            registration: RegistrationParams::default(),
            defects: DefectParams::default(),
            rejection_min_samples: 5,
            upscale_min_frames: 50,
            threads: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Method preset with any explicit overrides applied.
    pub fn drizzle(&self) -> DrizzleParams {
        let preset = self.method.drizzle();
        DrizzleParams {
            kernel: self.kernel.unwrap_or(preset.kernel),
            scale: self.scale.unwrap_or(preset.scale),
            pixfrac: self.pixfrac.unwrap_or(preset.pixfrac),
        }
    }

    pub fn sigma(&self) -> SigmaThresholds {
        self.sky_quality.sigma()
    }

    pub fn output_dir_for(&self, root: &Path) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| root.join("stacked"))
    }

    /// Checks every precondition that does not need frame data.
    pub fn validate(&self) -> Result<DrizzleParams> {
        let drizzle = self.drizzle();
        drizzle.validate()?;

        let sigma = self.sigma();
        if sigma.low <= 0.0 || sigma.high <= 0.0 {
            return Err(StackError::Config(format!(
                "sigma thresholds must be positive (low={}, high={})",
                sigma.low, sigma.high
            )));
        }
        if self.defects.hot_sigma <= 0.0 || self.defects.cold_sigma <= 0.0 {
            return Err(StackError::Config(
                "defect thresholds must be positive".to_string(),
            ));
        }
        if self.registration.min_matches < 2 {
            return Err(StackError::Config(format!(
                "registration needs at least 2 matched stars, got min_matches={}",
                self.registration.min_matches
            )));
        }
        Ok(drizzle)
    }
}
