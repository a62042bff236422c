//! Turns the four accumulated CFA-position planes into output channels.
//!
//! Demosaicing happens here, once, on the stacked planes. Narrowband modes
//! read CFA positions directly and never interpolate.

use crate::config::FilterMode;
use crate::drizzle::{FinalPlane, FinalizedPlanes};
use crate::frame::CfaColor;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Band {
    Red,
    Green,
    Blue,
    Ha,
    Oiii,
}

impl Band {
    pub fn name(self) -> &'static str {
        match self {
            Band::Red => "R",
            Band::Green => "G",
            Band::Blue => "B",
            Band::Ha => "Ha",
            Band::Oiii => "OIII",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One reconstructed channel. A pixel has data only where its weight is > 0.
#[derive(Debug, Clone)]
pub struct Channel {
    pub band: Band,
    pub value: Vec<f32>,
    pub weight: Vec<f32>,
}

impl Channel {
    fn from_plane(band: Band, plane: &FinalPlane) -> Self {
        Self {
            band,
            value: plane.values().to_vec(),
            weight: plane.weights().to_vec(),
        }
    }

    #[inline]
    pub fn get(&self, i: usize) -> Option<f32> {
        if self.weight[i] > 0.0 {
            Some(self.value[i])
        } else {
            None
        }
    }

    pub fn no_data_count(&self) -> usize {
        self.weight.iter().filter(|&&w| w <= 0.0).count()
    }
}

#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub width: usize,
    pub height: usize,
    pub mode: FilterMode,
    pub frames: usize,
    /// Whether color channels were interpolated from the CFA planes
    pub demosaiced: bool,
    pub channels: Vec<Channel>,
}

impl Reconstruction {
    pub fn channel(&self, band: Band) -> Option<&Channel> {
        self.channels.iter().find(|c| c.band == band)
    }
}

/// Filter mode is resolved once here; the per-pixel loops never branch on it.
#[derive(Debug, Clone, Copy)]
pub struct ChannelReconstructor {
    mode: FilterMode,
}

impl ChannelReconstructor {
    pub fn new(mode: FilterMode) -> Self {
        Self { mode }
    }

    pub fn reconstruct(&self, planes: &FinalizedPlanes) -> Reconstruction {
        let cfa = planes.cfa;
        let red = planes.plane(cfa.position_of(CfaColor::Red));
        let blue = planes.plane(cfa.position_of(CfaColor::Blue));

        let (channels, demosaiced) = match self.mode {
            FilterMode::Standard => {
                let [g1, g2] = cfa.green_positions();
                let green = merge_planes(Band::Green, planes.plane(g1), planes.plane(g2));
                let mut channels = vec![
                    Channel::from_plane(Band::Red, red),
                    green,
                    Channel::from_plane(Band::Blue, blue),
                ];
                for channel in channels.iter_mut() {
                    let filled = fill_gaps(channel, planes.width, planes.height);
                    tracing::debug!("{} channel: {} gaps filled", channel.band, filled);
                }
                (channels, true)
            }
            FilterMode::DualBand => (
                vec![
                    Channel::from_plane(Band::Ha, red),
                    Channel::from_plane(Band::Oiii, blue),
                ],
                false,
            ),
            FilterMode::NarrowbandHa => (vec![Channel::from_plane(Band::Ha, red)], false),
            FilterMode::NarrowbandOiii => (vec![Channel::from_plane(Band::Oiii, blue)], false),
        };

        tracing::info!(
            "Reconstructed {} channel(s) in {} mode ({}x{}{})",
            channels.len(),
            self.mode,
            planes.width,
            planes.height,
            if demosaiced { ", demosaiced" } else { "" }
        );

        Reconstruction {
            width: planes.width,
            height: planes.height,
            mode: self.mode,
            frames: planes.frames,
            demosaiced,
            channels,
        }
    }
}

/// Weight-averaged combination of the two green planes.
fn merge_planes(band: Band, a: &FinalPlane, b: &FinalPlane) -> Channel {
    let n = a.values().len();
    let mut value = vec![0f32; n];
    let mut weight = vec![0f32; n];
    for i in 0..n {
        let (wa, wb) = (a.weight(i), b.weight(i));
        let total = wa + wb;
        if total > 0.0 {
            let va = a.get(i).unwrap_or(0.0);
            let vb = b.get(i).unwrap_or(0.0);
            value[i] = (va * wa + vb * wb) / total;
            weight[i] = total;
        }
    }
    Channel {
        band,
        value,
        weight,
    }
}

/// Fill pixels without coverage from the weight-averaged 3x3 neighbors that
/// have data. Only original coverage is read, so the result does not depend
/// on scan order. Returns the number of filled pixels.
fn fill_gaps(channel: &mut Channel, width: usize, height: usize) -> usize {
    let source_value = channel.value.clone();
    let source_weight = channel.weight.clone();
    let mut filled = 0;

    for y in 0..height {
        for x in 0..width {
            let i = y * width + x;
            if source_weight[i] > 0.0 {
                continue;
            }
            let mut sum = 0.0f64;
            let mut total = 0.0f64;
            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    let j = ny * width + nx;
                    let w = source_weight[j] as f64;
                    if w > 0.0 {
                        sum += source_value[j] as f64 * w;
                        total += w;
                    }
                }
            }
            if total > 0.0 {
                channel.value[i] = (sum / total) as f32;
                channel.weight[i] = (total / 9.0) as f32;
                filled += 1;
            }
        }
    }
    filled
}
