use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Run-level failures. Anything here aborts the run before (or instead of)
/// producing a composite; per-frame problems are `FrameSkip` records instead.
#[derive(Error, Debug)]
pub enum StackError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Root folder is not accessible: {path}")]
    RootInaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No light frames found under {0}")]
    NoLightFrames(PathBuf),

    #[error("No usable light frames left after {stage} ({skipped} skipped)")]
    NoUsableFrames { stage: Stage, skipped: usize },

    #[error("Raster error for {path}: {message}")]
    Raster { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StackError {
    pub fn raster(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        StackError::Raster {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StackError>;

/// Pipeline stage a frame was dropped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classification,
    Mastering,
    Calibration,
    Registration,
    Accumulation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Classification => "classification",
            Stage::Mastering => "mastering",
            Stage::Calibration => "calibration",
            Stage::Registration => "registration",
            Stage::Accumulation => "accumulation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Not a FITS file, not 2-D, or truncated
    UnsupportedFormat { detail: String },
    /// FITS header was fine but the data could not be read
    Unreadable { detail: String },
    /// Width/height differ from the rest of the set
    GeometryMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    RegistrationFailed { matched: usize, required: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsupportedFormat { detail } => write!(f, "unsupported format: {}", detail),
            SkipReason::Unreadable { detail } => write!(f, "unreadable: {}", detail),
            SkipReason::GeometryMismatch { expected, found } => write!(
                f,
                "geometry mismatch: expected {}x{}, found {}x{}",
                expected.0, expected.1, found.0, found.1
            ),
            SkipReason::RegistrationFailed { matched, required } => write!(
                f,
                "registration failed: {} matched stars, {} required",
                matched, required
            ),
        }
    }
}

/// A frame dropped from the run, with the reason it was dropped.
#[derive(Debug, Clone, Serialize)]
pub struct FrameSkip {
    pub path: PathBuf,
    pub stage: Stage,
    pub reason: SkipReason,
}

impl FrameSkip {
    pub fn new(path: impl Into<PathBuf>, stage: Stage, reason: SkipReason) -> Self {
        let skip = FrameSkip {
            path: path.into(),
            stage,
            reason,
        };
        tracing::warn!(
            "Skipping {} during {}: {}",
            skip.path.display(),
            skip.stage,
            skip.reason
        );
        skip
    }
}
