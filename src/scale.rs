//! Sequential colour scale for station markers.
//!
//! The domain is the min/max PM2.5 value of the collection being drawn; the range is a
//! linear RGB ramp between two configured colours. Values outside the domain clamp to
//! the nearest end.

use crate::config::StyleConfig;
use crate::types::{PointFeature, ValueRange};
use anyhow::{anyhow, Result};
use image::Rgb;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequentialScale {
    low: Rgb<u8>,
    high: Rgb<u8>,
    domain: Option<ValueRange>,
}

impl SequentialScale {
    pub fn new(low: Rgb<u8>, high: Rgb<u8>, domain: Option<ValueRange>) -> Self {
        Self { low, high, domain }
    }

    pub fn for_points(style: &StyleConfig, points: &[PointFeature]) -> Result<Self> {
        Ok(Self::new(
            hex_to_rgb(&style.low_color)?,
            hex_to_rgb(&style.high_color)?,
            ValueRange::of(points),
        ))
    }

    pub fn domain(&self) -> Option<ValueRange> {
        self.domain
    }

    /// Position of `v` within the domain, in [0, 1].
    pub fn normalize(&self, v: f64) -> f64 {
        match self.domain {
            Some(ValueRange { min, max }) if max > min => ((v - min) / (max - min)).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }

    pub fn color(&self, v: f64) -> Rgb<u8> {
        self.at(self.normalize(v))
    }

    /// Colour at ramp position `t` in [0, 1].
    pub fn at(&self, t: f64) -> Rgb<u8> {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        let mix = |a: u8, b: u8| (a as f64 + t * (b as f64 - a as f64)).round() as u8;
        Rgb([
            mix(self.low[0], self.high[0]),
            mix(self.low[1], self.high[1]),
            mix(self.low[2], self.high[2]),
        ])
    }
}

pub fn hex_to_rgb(hex: &str) -> Result<Rgb<u8>> {
    let digits = hex.trim_start_matches('#');
    if digits.len() != 6 || !digits.is_ascii() {
        return Err(anyhow!("Invalid hex colour: {:?}", hex));
    }
    let channel = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&digits[range], 16).map_err(|_| anyhow!("Invalid hex colour: {:?}", hex))
    };
    Ok(Rgb([channel(0..2)?, channel(2..4)?, channel(4..6)?]))
}

pub fn rgb_to_hex(color: Rgb<u8>) -> String {
    format!("#{:02x}{:02x}{:02x}", color[0], color[1], color[2])
}
