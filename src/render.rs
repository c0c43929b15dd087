use crate::projection::Projection;
use crate::scale::{rgb_to_hex, SequentialScale};
use crate::types::{CountyFeature, PointFeature};
use anyhow::{Context, Result};
use geo::{Coord, LineString};
use image::{ImageBuffer, Rgb, RgbImage};
use rayon::prelude::*;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const MAP_FILL: &str = "#c2cfd3";
const MAP_BORDER: &str = "#5e5a51";
const HOVER_FILL: &str = "#ffcc00";
const HOVER_BORDER: &str = "#ff9900";
const CIRCLE_HOVER: &str = "#d2e0f5";
const MARKER_RADIUS: f64 = 5.0;
const MARKER_HOVER_RADIUS: f64 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisualState {
    #[default]
    Default,
    Highlighted,
}

/// Addresses one drawn element by its position in the source collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureRef {
    County(usize),
    Marker(usize),
}

impl std::str::FromStr for FeatureRef {
    type Err = String;

    /// Parses `county:<n>` or `station:<n>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (layer, index) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <layer>:<index>, got {s:?}"))?;
        let index: usize = index
            .parse()
            .map_err(|_| format!("invalid feature index {index:?}"))?;
        match layer {
            "county" => Ok(FeatureRef::County(index)),
            "station" => Ok(FeatureRef::Marker(index)),
            _ => Err(format!("unknown layer {layer:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapeStyle {
    pub fill: String,
    pub stroke: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerStyle {
    pub fill: String,
    pub radius: f64,
}

#[derive(Debug, Clone)]
pub struct Shape {
    pub county_id: String,
    pub name: String,
    pub path: String,
    pub state: VisualState,
}

impl Shape {
    pub fn style(&self) -> ShapeStyle {
        match self.state {
            VisualState::Default => ShapeStyle {
                fill: MAP_FILL.into(),
                stroke: MAP_BORDER.into(),
            },
            VisualState::Highlighted => ShapeStyle {
                fill: HOVER_FILL.into(),
                stroke: HOVER_BORDER.into(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Marker {
    // index of the point this marker was drawn from
    pub source: usize,
    pub name: String,
    pub position: Coord<f64>,
    pub avg_pm25: f64,
    pub color: Rgb<u8>,
    pub state: VisualState,
}

impl Marker {
    pub fn style(&self) -> MarkerStyle {
        match self.state {
            VisualState::Default => MarkerStyle {
                fill: rgb_to_hex(self.color),
                radius: MARKER_RADIUS,
            },
            VisualState::Highlighted => MarkerStyle {
                fill: CIRCLE_HOVER.into(),
                radius: MARKER_HOVER_RADIUS,
            },
        }
    }

    /// Tooltip label and text for this station.
    pub fn tooltip(&self) -> (String, String) {
        (self.name.clone(), tooltip_text(self.avg_pm25))
    }
}

pub fn tooltip_text(avg_pm25: f64) -> String {
    format!("Avg PM2.5: {:.2}", avg_pm25)
}

/// Drawn map: county shapes beneath station markers, each with its own hover state.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub width: u32,
    pub height: u32,
    shapes: Vec<Shape>,
    markers: Vec<Marker>,
}

impl Scene {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Replaces the county layer with one shape per county, in collection order.
    pub fn draw_counties(&mut self, counties: &[CountyFeature], projection: &dyn Projection) {
        self.shapes = counties
            .par_iter()
            .map(|county| Shape {
                county_id: county.id.clone(),
                name: county.name.clone(),
                path: county_path(county, projection),
                state: VisualState::Default,
            })
            .collect();
        debug!("Drew {} county shapes", self.shapes.len());
    }

    /// Clears existing markers, then draws one per point coloured by `scale`.
    pub fn draw_points(
        &mut self,
        points: &[PointFeature],
        projection: &dyn Projection,
        scale: &SequentialScale,
    ) {
        self.markers.clear();
        for (source, point) in points.iter().enumerate() {
            let Some(position) = projection.project(point.point.0) else {
                warn!("Station {} cannot be projected, skipping", point.name);
                continue;
            };
            self.markers.push(Marker {
                source,
                name: point.name.clone(),
                position,
                avg_pm25: point.avg_pm25,
                color: scale.color(point.avg_pm25),
                state: VisualState::Default,
            });
        }
        debug!("Drew {} station markers", self.markers.len());
    }

    fn state_mut(&mut self, feature: FeatureRef) -> Option<&mut VisualState> {
        match feature {
            FeatureRef::County(i) => self.shapes.get_mut(i).map(|s| &mut s.state),
            FeatureRef::Marker(i) => self
                .markers
                .iter_mut()
                .find(|m| m.source == i)
                .map(|m| &mut m.state),
        }
    }

    pub fn state(&self, feature: FeatureRef) -> Option<VisualState> {
        match feature {
            FeatureRef::County(i) => self.shapes.get(i).map(|s| s.state),
            FeatureRef::Marker(i) => self.markers.iter().find(|m| m.source == i).map(|m| m.state),
        }
    }

    /// Returns false when `feature` does not exist.
    pub fn hover(&mut self, feature: FeatureRef) -> bool {
        self.set_state(feature, VisualState::Highlighted)
    }

    pub fn unhover(&mut self, feature: FeatureRef) -> bool {
        self.set_state(feature, VisualState::Default)
    }

    fn set_state(&mut self, feature: FeatureRef, state: VisualState) -> bool {
        match self.state_mut(feature) {
            Some(s) => {
                *s = state;
                true
            }
            None => false,
        }
    }

    pub fn to_svg(&self) -> String {
        let mut svg = String::new();
        let _ = writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
            w = self.width,
            h = self.height
        );

        svg.push_str("<g class=\"counties\">\n");
        for shape in &self.shapes {
            let style = shape.style();
            let _ = writeln!(
                svg,
                r#"<path d="{}" fill="{}" stroke="{}" data-id="{}"><title>{}</title></path>"#,
                shape.path,
                style.fill,
                style.stroke,
                escape_xml(&shape.county_id),
                escape_xml(&shape.name)
            );
        }
        svg.push_str("</g>\n");

        svg.push_str("<g class=\"stations\">\n");
        for marker in &self.markers {
            let style = marker.style();
            let (label, text) = marker.tooltip();
            let _ = writeln!(
                svg,
                r#"<circle cx="{:.2}" cy="{:.2}" r="{}" fill="{}" data-index="{}"><title>{}&#10;{}</title></circle>"#,
                marker.position.x,
                marker.position.y,
                style.radius,
                style.fill,
                marker.source,
                escape_xml(&label),
                escape_xml(&text)
            );
        }
        svg.push_str("</g>\n</svg>\n");
        svg
    }
}

fn ring_path(ring: &LineString<f64>, projection: &dyn Projection, out: &mut String) {
    let mut first = true;
    for coord in ring.coords() {
        let Some(p) = projection.project(*coord) else {
            continue;
        };
        let cmd = if first { 'M' } else { 'L' };
        let _ = write!(out, "{}{:.2},{:.2}", cmd, p.x, p.y);
        first = false;
    }
    if !first {
        out.push('Z');
    }
}

fn county_path(county: &CountyFeature, projection: &dyn Projection) -> String {
    let mut d = String::new();
    for polygon in &county.geometry {
        ring_path(polygon.exterior(), projection, &mut d);
        for interior in polygon.interiors() {
            ring_path(interior, projection, &mut d);
        }
    }
    d
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Horizontal colour ramp strip, low values on the left.
pub fn legend_image(scale: &SequentialScale, width: u32, height: u32) -> RgbImage {
    let span = width.saturating_sub(1).max(1) as f64;
    ImageBuffer::from_fn(width, height, |x, _| scale.at(x as f64 / span))
}

pub fn write_map(scene: &Scene, scale: &SequentialScale, dir: &Path, year: &str) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory {:?}", dir))?;

    let svg_path = dir.join(format!("{year}.svg"));
    fs::write(&svg_path, scene.to_svg())
        .with_context(|| format!("Failed to write map {:?}", svg_path))?;

    let legend_path = dir.join("legend.png");
    legend_image(scale, 256, 16)
        .save(&legend_path)
        .with_context(|| format!("Failed to write legend {:?}", legend_path))?;

    Ok(())
}
