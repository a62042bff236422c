use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CfaColor {
    Red,
    Green,
    Blue,
}

/// 2x2 Bayer layout, named by the top-left row then the second row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CfaPattern {
    Rggb,
    Bggr,
    Grbg,
    Gbrg,
}

impl CfaPattern {
    pub const ALL: [CfaPattern; 4] = [
        CfaPattern::Rggb,
        CfaPattern::Bggr,
        CfaPattern::Grbg,
        CfaPattern::Gbrg,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CfaPattern::Rggb => "RGGB",
            CfaPattern::Bggr => "BGGR",
            CfaPattern::Grbg => "GRBG",
            CfaPattern::Gbrg => "GBRG",
        }
    }

    /// Colors of the four CFA positions in (0,0), (1,0), (0,1), (1,1) order.
    pub fn colors(self) -> [CfaColor; 4] {
        use CfaColor::*;
        match self {
            CfaPattern::Rggb => [Red, Green, Green, Blue],
            CfaPattern::Bggr => [Blue, Green, Green, Red],
            CfaPattern::Grbg => [Green, Red, Blue, Green],
            CfaPattern::Gbrg => [Green, Blue, Red, Green],
        }
    }

    pub fn color_at(self, x: usize, y: usize) -> CfaColor {
        self.colors()[cfa_position(x, y)]
    }

    /// CFA position index holding the given color. Green has two; the first
    /// one in scan order is returned.
    pub fn position_of(self, color: CfaColor) -> usize {
        self.colors()
            .iter()
            .position(|&c| c == color)
            .unwrap_or(0)
    }

    pub fn green_positions(self) -> [usize; 2] {
        let colors = self.colors();
        let mut found = [0usize; 2];
        let mut n = 0;
        for (i, c) in colors.iter().enumerate() {
            if *c == CfaColor::Green && n < 2 {
                found[n] = i;
                n += 1;
            }
        }
        found
    }
}

impl FromStr for CfaPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RGGB" => Ok(CfaPattern::Rggb),
            "BGGR" => Ok(CfaPattern::Bggr),
            "GRBG" => Ok(CfaPattern::Grbg),
            "GBRG" => Ok(CfaPattern::Gbrg),
            other => Err(format!("Unsupported CFA pattern: {}", other)),
        }
    }
}

impl fmt::Display for CfaPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index 0..4 of the 2x2 CFA cell a pixel falls in.
#[inline]
pub fn cfa_position(x: usize, y: usize) -> usize {
    (y & 1) * 2 + (x & 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorGeometry {
    pub width: usize,
    pub height: usize,
    pub cfa: CfaPattern,
}

impl SensorGeometry {
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn same_framing(&self, other: &SensorGeometry) -> bool {
        self.width == other.width && self.height == other.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Light,
    Dark,
    Unknown,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FrameKind::Light => "light",
            FrameKind::Dark => "dark",
            FrameKind::Unknown => "unknown",
        })
    }
}

/// One captured exposure: a single CFA mosaic plane in physical units.
#[derive(Debug, Clone)]
pub struct RasterFrame {
    pub path: PathBuf,
    pub kind: FrameKind,
    pub geometry: SensorGeometry,
    pub bit_depth: i32,
    pub timestamp: Option<NaiveDateTime>,
    /// Seconds
    pub exposure: Option<f64>,
    pub data: Vec<f32>,
    /// Descriptive header cards passed through to produced artifacts
    pub carried_headers: Vec<(String, String)>,
}

impl RasterFrame {
    pub fn width(&self) -> usize {
        self.geometry.width
    }

    pub fn height(&self) -> usize {
        self.geometry.height
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.geometry.width + x]
    }

    /// Half-resolution luminance made by summing each 2x2 CFA cell, which
    /// removes the mosaic pattern before star extraction.
    pub fn superpixel_luminance(&self) -> (Vec<f32>, usize, usize) {
        let w = self.geometry.width / 2;
        let h = self.geometry.height / 2;
        let stride = self.geometry.width;
        let mut out = vec![0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                let i = 2 * y * stride + 2 * x;
                out[y * w + x] =
                    self.data[i] + self.data[i + 1] + self.data[i + stride] + self.data[i + stride + 1];
            }
        }
        (out, w, h)
    }
}

#[cfg(test)]
impl RasterFrame {
    pub(crate) fn synthetic(name: &str, width: usize, height: usize, data: Vec<f32>) -> RasterFrame {
        assert_eq!(data.len(), width * height);
        RasterFrame {
            path: PathBuf::from(name),
            kind: FrameKind::Light,
            geometry: SensorGeometry {
                width,
                height,
                cfa: CfaPattern::Rggb,
            },
            bit_depth: -32,
            timestamp: None,
            exposure: Some(10.0),
            data,
            carried_headers: Vec::new(),
        }
    }
}
