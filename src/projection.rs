use crate::config::ProjectionConfig;
use anyhow::{anyhow, Result};
use geo::Coord;
use std::f64::consts::FRAC_PI_4;

/// Maps geographic coordinates (x = longitude, y = latitude, degrees) onto the drawing plane.
pub trait Projection: Send + Sync {
    /// Returns `None` when the coordinate has no image under this projection.
    fn project(&self, coord: Coord<f64>) -> Option<Coord<f64>>;
}

/// Spherical Mercator centred on a geographic point, scaled and translated into a
/// `width` x `height` viewport. Screen y grows downward.
#[derive(Debug, Clone, Copy)]
pub struct Mercator {
    scale: f64,
    center_raw: Coord<f64>,
    translate: Coord<f64>,
}

impl Mercator {
    /// Fails when the centre itself has no image (non-finite or at a pole).
    pub fn new(scale: f64, center: [f64; 2], width: u32, height: u32) -> Result<Self> {
        let center_raw = raw_mercator(center[0], center[1])
            .ok_or_else(|| anyhow!("projection center {:?} cannot be projected", center))?;
        Ok(Self {
            scale,
            center_raw,
            translate: Coord {
                x: width as f64 / 2.0,
                y: height as f64 / 2.0,
            },
        })
    }

    pub fn from_config(config: &ProjectionConfig) -> Result<Self> {
        Self::new(config.scale, config.center, config.width, config.height)
    }
}

fn raw_mercator(lon: f64, lat: f64) -> Option<Coord<f64>> {
    if !lon.is_finite() || !lat.is_finite() || lat.abs() >= 90.0 {
        return None;
    }
    let lambda = lon.to_radians();
    let phi = lat.to_radians();
    Some(Coord {
        x: lambda,
        y: (FRAC_PI_4 + phi / 2.0).tan().ln(),
    })
}

impl Projection for Mercator {
    fn project(&self, coord: Coord<f64>) -> Option<Coord<f64>> {
        let raw = raw_mercator(coord.x, coord.y)?;
        Some(Coord {
            x: self.translate.x + self.scale * (raw.x - self.center_raw.x),
            y: self.translate.y - self.scale * (raw.y - self.center_raw.y),
        })
    }
}
