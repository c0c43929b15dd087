use crate::projection::Mercator;
use crate::scale::hex_to_rgb;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub projection: ProjectionConfig,
    #[serde(default)]
    pub style: StyleConfig,
    pub output: OutputConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub counties: PathBuf, // .geojson, .json or .shp
    pub data_dir: PathBuf,
    pub years: Vec<String>,
    pub default_year: String,
    #[serde(default = "default_state_fp")]
    pub state_fp: String,
    #[serde(default = "default_county_name_column")]
    pub county_name_column: String,
    #[serde(default)]
    pub csv: CsvLayout,
}

/// A CSV column addressed either by header name or by zero-based position.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct CsvLayout {
    #[serde(default = "default_true")]
    pub has_headers: bool,
    pub name: ColumnRef,
    pub longitude: ColumnRef,
    pub latitude: ColumnRef,
    pub value: ColumnRef,
}

impl Default for CsvLayout {
    fn default() -> Self {
        Self {
            has_headers: true,
            name: ColumnRef::Name("name".into()),
            longitude: ColumnRef::Name("longitude".into()),
            latitude: ColumnRef::Name("latitude".into()),
            value: ColumnRef::Name("avgPM25".into()),
        }
    }
}

impl CsvLayout {
    /// Headerless layout: name, longitude, latitude, value in that order.
    pub fn positional() -> Self {
        Self {
            has_headers: false,
            name: ColumnRef::Index(0),
            longitude: ColumnRef::Index(1),
            latitude: ColumnRef::Index(2),
            value: ColumnRef::Index(3),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectionConfig {
    pub scale: f64,
    pub center: [f64; 2], // [lon, lat]
    pub width: u32,
    pub height: u32,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            scale: 5000.0,
            center: [-111.0937, 39.3200],
            width: 600,
            height: 800,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StyleConfig {
    pub low_color: String, // Hex code
    pub high_color: String,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            low_color: "#293742".into(),
            high_color: "#e34a33".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

fn default_state_fp() -> String {
    "49".into()
}

fn default_county_name_column() -> String {
    "NAME".into()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.input.years.contains(&self.input.default_year) {
            bail!(
                "default_year '{}' is not one of the configured years {:?}",
                self.input.default_year,
                self.input.years
            );
        }
        if !(self.projection.scale.is_finite() && self.projection.scale > 0.0) {
            bail!("projection scale must be positive, got {}", self.projection.scale);
        }
        Mercator::from_config(&self.projection)?;
        hex_to_rgb(&self.style.low_color).context("style.low_color")?;
        hex_to_rgb(&self.style.high_color).context("style.high_color")?;
        Ok(())
    }

    pub fn has_year(&self, year: &str) -> bool {
        self.input.years.iter().any(|y| y == year)
    }

    /// CSV file for a given year: `<data_dir>/<year>.csv`.
    pub fn csv_path(&self, year: &str) -> PathBuf {
        self.input.data_dir.join(format!("{year}.csv"))
    }
}
