use crate::config::SensorProfile;
use crate::error::{Result, StackError};
use crate::fits::{is_carried_key, read_image_data, validate_image_file, write_f32_image, Card};
use crate::frame::{CfaPattern, FrameKind, RasterFrame, SensorGeometry};
use chrono::NaiveDateTime;
use std::path::Path;

const DATE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Raster I/O the pipeline drives. Calls are synchronous; implementations
/// must be shareable across the frame workers.
pub trait RasterStore: Send + Sync {
    fn load(&self, path: &Path, kind: FrameKind) -> Result<RasterFrame>;

    fn save_mono(
        &self,
        path: &Path,
        width: usize,
        height: usize,
        data: &[f32],
        cards: &[(String, Card)],
    ) -> Result<()>;

    /// Planes are written as a (width, height, 3) cube in R, G, B order.
    fn save_rgb(
        &self,
        path: &Path,
        width: usize,
        height: usize,
        planes: [&[f32]; 3],
        cards: &[(String, Card)],
    ) -> Result<()>;
}

/// FITS files on the local file system.
#[derive(Debug, Clone, Default)]
pub struct FitsStore {
    sensor: SensorProfile,
}

impl FitsStore {
    pub fn new(sensor: SensorProfile) -> Self {
        Self { sensor }
    }
}

impl RasterStore for FitsStore {
    fn load(&self, path: &Path, kind: FrameKind) -> Result<RasterFrame> {
        let (metadata, info) = validate_image_file(path)?;
        let data = read_image_data(path, &info, &metadata)?;

        let cfa = match metadata.get("BAYERPAT") {
            Some(pattern) => pattern
                .parse::<CfaPattern>()
                .map_err(|e| StackError::raster(path, e))?,
            None => {
                if !self.sensor.matches(info.width, info.height) {
                    tracing::warn!(
                        "{} has no BAYERPAT and is {}x{}, not the {}x{} {} frame; assuming {}",
                        path.display(),
                        info.width,
                        info.height,
                        self.sensor.width,
                        self.sensor.height,
                        self.sensor.name,
                        self.sensor.cfa.name()
                    );
                }
                self.sensor.cfa
            }
        };

        let timestamp = metadata
            .get("DATE-OBS")
            .and_then(parse_timestamp);
        let exposure = metadata
            .get_f64("EXPTIME")
            .or_else(|| metadata.get_f64("EXPOSURE"));

        let mut carried_headers: Vec<(String, String)> = metadata
            .primary_header
            .iter()
            .filter(|(k, _)| is_carried_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        carried_headers.sort();

        Ok(RasterFrame {
            path: path.to_path_buf(),
            kind,
            geometry: SensorGeometry {
                width: info.width,
                height: info.height,
                cfa,
            },
            bit_depth: info.bit_depth,
            timestamp,
            exposure,
            data,
            carried_headers,
        })
    }

    fn save_mono(
        &self,
        path: &Path,
        width: usize,
        height: usize,
        data: &[f32],
        cards: &[(String, Card)],
    ) -> Result<()> {
        write_f32_image(path, &[width, height], data.to_vec(), cards)
    }

    fn save_rgb(
        &self,
        path: &Path,
        width: usize,
        height: usize,
        planes: [&[f32]; 3],
        cards: &[(String, Card)],
    ) -> Result<()> {
        let mut cube = Vec::with_capacity(width * height * 3);
        for plane in planes {
            if plane.len() != width * height {
                return Err(StackError::raster(
                    path,
                    format!("plane of {} values does not fit {}x{}", plane.len(), width, height),
                ));
            }
            cube.extend_from_slice(plane);
        }
        write_f32_image(path, &[width, height, 3], cube, cards)
    }
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}
