use crate::config::{ColumnRef, CsvLayout};
use crate::types::{CountyFeature, PointFeature};
use anyhow::{anyhow, Context, Result};
use csv::{ReaderBuilder, StringRecord};
use geo::{MultiPolygon, Point};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, JsonObject, Value};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowErrorKind {
    #[error("missing {0} field")]
    MissingField(&'static str),
    #[error("{field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("{0} is not finite")]
    NonFinite(&'static str),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("negative PM2.5 value: {0}")]
    NegativeValue(f64),
    #[error("empty station name")]
    EmptyName,
    #[error("unreadable row: {0}")]
    Malformed(String),
}

/// A rejected CSV row. `line` is 1-based and counts the header line.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {kind}")]
pub struct RowError {
    pub line: u64,
    pub kind: RowErrorKind,
}

/// Result of converting one CSV file: valid features in file order plus the rows skipped.
#[derive(Debug, Default)]
pub struct Conversion {
    pub features: Vec<PointFeature>,
    pub rejected: Vec<RowError>,
}

struct ColumnIndices {
    name: usize,
    longitude: usize,
    latitude: usize,
    value: usize,
}

fn resolve_column(col: &ColumnRef, headers: Option<&StringRecord>) -> Result<usize> {
    match col {
        ColumnRef::Index(i) => Ok(*i),
        ColumnRef::Name(name) => {
            let headers = headers
                .ok_or_else(|| anyhow!("Column '{}' is named but the CSV has no header", name))?;
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| anyhow!("Column '{}' not found in CSV header", name))
        }
    }
}

pub fn convert_csv(path: &Path, layout: &CsvLayout) -> Result<Conversion> {
    let file =
        File::open(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    let conversion = convert_csv_reader(file, layout)
        .with_context(|| format!("Failed to convert CSV file: {:?}", path))?;
    info!(
        path = %path.display(),
        features = conversion.features.len(),
        rejected = conversion.rejected.len(),
        "converted station readings"
    );
    Ok(conversion)
}

pub fn convert_csv_reader<R: Read>(reader: R, layout: &CsvLayout) -> Result<Conversion> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(layout.has_headers)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = if layout.has_headers {
        Some(rdr.headers().context("Failed to read CSV header")?.clone())
    } else {
        None
    };

    let cols = ColumnIndices {
        name: resolve_column(&layout.name, headers.as_ref())?,
        longitude: resolve_column(&layout.longitude, headers.as_ref())?,
        latitude: resolve_column(&layout.latitude, headers.as_ref())?,
        value: resolve_column(&layout.value, headers.as_ref())?,
    };

    let first_data_line = if layout.has_headers { 2 } else { 1 };
    let mut conversion = Conversion::default();

    for (i, result) in rdr.records().enumerate() {
        let fallback_line = first_data_line + i as u64;
        let parsed = match result {
            Ok(record) => {
                let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);
                parse_row(&record, &cols).map_err(|kind| RowError { line, kind })
            }
            Err(e) => Err(RowError {
                line: e.position().map(|p| p.line()).unwrap_or(fallback_line),
                kind: RowErrorKind::Malformed(e.to_string()),
            }),
        };

        match parsed {
            Ok(feature) => conversion.features.push(feature),
            Err(err) => {
                warn!("Skipping CSV row: {}", err);
                conversion.rejected.push(err);
            }
        }
    }

    Ok(conversion)
}

fn field<'r>(
    record: &'r StringRecord,
    idx: usize,
    name: &'static str,
) -> Result<&'r str, RowErrorKind> {
    match record.get(idx) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(RowErrorKind::MissingField(name)),
    }
}

fn number(
    record: &StringRecord,
    idx: usize,
    name: &'static str,
    range: (f64, f64),
) -> Result<f64, RowErrorKind> {
    let raw = field(record, idx, name)?;
    let value: f64 = raw.parse().map_err(|_| RowErrorKind::InvalidNumber {
        field: name,
        value: raw.to_string(),
    })?;
    if !value.is_finite() {
        return Err(RowErrorKind::NonFinite(name));
    }
    if value < range.0 || value > range.1 {
        return Err(RowErrorKind::OutOfRange { field: name, value });
    }
    Ok(value)
}

fn parse_row(record: &StringRecord, cols: &ColumnIndices) -> Result<PointFeature, RowErrorKind> {
    let name = field(record, cols.name, "name").map_err(|_| RowErrorKind::EmptyName)?;
    let longitude = number(record, cols.longitude, "longitude", (-180.0, 180.0))?;
    let latitude = number(record, cols.latitude, "latitude", (-90.0, 90.0))?;
    let avg_pm25 = number(record, cols.value, "avgPM25", (f64::NEG_INFINITY, f64::INFINITY))?;
    if avg_pm25 < 0.0 {
        return Err(RowErrorKind::NegativeValue(avg_pm25));
    }
    // folds -0.0 into 0.0
    let avg_pm25 = avg_pm25.abs();

    Ok(PointFeature {
        name: name.to_string(),
        point: Point::new(longitude, latitude),
        avg_pm25,
    })
}

/// Converts a CSV off the async runtime; the caller awaits the finished collection.
pub async fn load_points(path: PathBuf, layout: CsvLayout) -> Result<Conversion> {
    tokio::task::spawn_blocking(move || convert_csv(&path, &layout))
        .await
        .context("CSV conversion task failed")?
}

pub fn points_to_geojson(points: &[PointFeature]) -> FeatureCollection {
    let features = points
        .iter()
        .map(|p| {
            let mut props = JsonObject::new();
            props.insert("name".into(), p.name.clone().into());
            props.insert("avgPM25".into(), p.avg_pm25.into());
            Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Point(vec![
                    p.longitude(),
                    p.latitude(),
                ]))),
                id: None,
                properties: Some(props),
                foreign_members: None,
            }
        })
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

pub fn counties_to_geojson(counties: &[CountyFeature]) -> FeatureCollection {
    let features = counties
        .iter()
        .map(|c| {
            let mut props = JsonObject::new();
            props.insert("GEOID".into(), c.id.clone().into());
            props.insert("NAME".into(), c.name.clone().into());
            props.insert("STATEFP".into(), c.state_fp.clone().into());
            Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::from(&c.geometry))),
                id: None,
                properties: Some(props),
                foreign_members: None,
            }
        })
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

/// Loads county polygons and keeps only those whose `STATEFP` equals `state_fp`.
pub fn load_counties(path: &Path, state_fp: &str, name_column: &str) -> Result<Vec<CountyFeature>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .ok_or_else(|| anyhow!("County geometry file has no extension"))?;

    let counties = match extension.as_str() {
        "shp" => load_shapefile_counties(path, state_fp, name_column)?,
        "json" | "geojson" => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
            load_geojson_counties(BufReader::new(file), state_fp, name_column)?
        }
        _ => return Err(anyhow!("Unsupported geometry format: {}", extension)),
    };

    info!(
        path = %path.display(),
        state_fp,
        counties = counties.len(),
        "loaded county boundaries"
    );
    Ok(counties)
}

pub async fn load_counties_async(
    path: PathBuf,
    state_fp: String,
    name_column: String,
) -> Result<Vec<CountyFeature>> {
    tokio::task::spawn_blocking(move || load_counties(&path, &state_fp, &name_column))
        .await
        .context("County loading task failed")?
}

/// Two-digit FIPS code; numeric codes lose their leading zero in some exports.
fn state_code(value: Option<&serde_json::Value>) -> Option<String> {
    match value {
        Some(serde_json::Value::Number(n)) => match n.as_u64() {
            Some(code) => Some(format!("{code:02}")),
            None => Some(n.to_string()),
        },
        other => property_string(other),
    }
}

fn property_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

pub fn load_geojson_counties<R: Read>(
    reader: R,
    state_fp: &str,
    name_column: &str,
) -> Result<Vec<CountyFeature>> {
    let geojson = GeoJson::from_reader(reader).context("Failed to parse GeoJSON")?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("County GeoJSON must be a FeatureCollection")),
    };

    let mut counties = Vec::new();

    for (i, feature) in collection.features.into_iter().enumerate() {
        let props = feature.properties.as_ref();
        let Some(code) = state_code(props.and_then(|p| p.get("STATEFP"))) else {
            continue;
        };
        if code != state_fp {
            continue;
        }

        let id = property_string(props.and_then(|p| p.get("GEOID")))
            .unwrap_or_else(|| i.to_string());
        let name = property_string(props.and_then(|p| p.get(name_column)))
            .unwrap_or_else(|| id.clone());

        let geometry = match feature.geometry {
            Some(geom) => match geo::Geometry::<f64>::try_from(geom.value) {
                Ok(geo::Geometry::MultiPolygon(mp)) => mp,
                Ok(geo::Geometry::Polygon(p)) => MultiPolygon::new(vec![p]),
                Ok(_) => {
                    debug!("County {} is not a polygon, skipping", id);
                    continue;
                }
                Err(e) => {
                    warn!("County {} has invalid geometry: {:?}", id, e);
                    continue;
                }
            },
            None => continue,
        };

        counties.push(CountyFeature {
            id,
            name,
            state_fp: code,
            geometry,
        });
    }

    Ok(counties)
}

fn load_shapefile_counties(
    path: &Path,
    state_fp: &str,
    name_column: &str,
) -> Result<Vec<CountyFeature>> {
    use shapefile::dbase::FieldValue;

    let mut reader = shapefile::Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let text = |value: Option<&FieldValue>| match value {
        Some(FieldValue::Character(Some(s))) => Some(s.trim().to_string()),
        Some(FieldValue::Numeric(Some(n))) => Some(n.to_string()),
        _ => None,
    };

    let mut counties = Vec::new();

    for (i, result) in reader.iter_shapes_and_records().enumerate() {
        let (shape, record) = result?;

        let code = match record.get("STATEFP") {
            Some(FieldValue::Numeric(Some(n))) if n.fract() == 0.0 && *n >= 0.0 => {
                format!("{:02}", *n as u64)
            }
            other => match text(other) {
                Some(code) => code,
                None => continue,
            },
        };
        if code != state_fp {
            continue;
        }
        let id = text(record.get("GEOID")).unwrap_or_else(|| i.to_string());
        let name = text(record.get(name_column)).unwrap_or_else(|| id.clone());

        let converted: Result<MultiPolygon<f64>, _> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon.try_into(),
            shapefile::Shape::PolygonM(polygon) => polygon.try_into(),
            shapefile::Shape::PolygonZ(polygon) => polygon.try_into(),
            _ => {
                debug!("County {} is not a polygon, skipping", id);
                continue;
            }
        };
        let geometry = match converted {
            Ok(mp) => mp,
            Err(e) => {
                warn!("County {} has invalid geometry: {:?}", id, e);
                continue;
            }
        };

        counties.push(CountyFeature {
            id,
            name,
            state_fp: code,
            geometry,
        });
    }

    Ok(counties)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn convert(input: &str) -> Conversion {
        convert_bytes(input.as_bytes())
    }

    fn convert_bytes(input: &[u8]) -> Conversion {
        convert_csv_reader(input, &CsvLayout::positional()).unwrap()
    }

    #[test]
    fn converts_a_valid_row() {
        let out = convert("StationA,-111.5,40.2,12.5\n");
        assert!(out.rejected.is_empty());
        assert_eq!(
            out.features,
            vec![PointFeature {
                name: "StationA".into(),
                point: Point::new(-111.5, 40.2),
                avg_pm25: 12.5,
            }]
        );
    }

    #[test]
    fn nan_row_is_skipped_and_rest_converts() {
        let out = convert("StationA,-111.5,40.2,12.5\nStationB,NaN,40.2,8.0\nStationC,-112.0,41.0,3.0\n");
        let names: Vec<_> = out.features.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["StationA", "StationC"]);
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.rejected[0].line, 2);
        assert_eq!(out.rejected[0].kind, RowErrorKind::NonFinite("longitude"));
    }

    #[test]
    fn output_length_matches_valid_rows() {
        let input = "\
ok1,-111.0,40.0,1.0
bad-number,abc,40.0,1.0
,-111.0,40.0,1.0
far-north,-111.0,95.0,1.0
negative,-111.0,40.0,-2.0
short,-111.0
ok2,-110.0,39.0,0.0
inf,-111.0,40.0,inf
";
        let mut bytes = input.as_bytes().to_vec();
        bytes.extend_from_slice(b"bad\xff\xfename,-111.0,40.0,1.0\nok3,-109.0,38.0,2.0\n");
        let out = convert_bytes(&bytes);
        assert_eq!(out.features.len(), 3);
        assert_eq!(out.rejected.len(), 7);
        assert!(matches!(out.rejected[0].kind, RowErrorKind::InvalidNumber { field: "longitude", .. }));
        assert_eq!(out.rejected[1].kind, RowErrorKind::EmptyName);
        assert!(matches!(out.rejected[2].kind, RowErrorKind::OutOfRange { field: "latitude", .. }));
        assert_eq!(out.rejected[3].kind, RowErrorKind::NegativeValue(-2.0));
        assert_eq!(out.rejected[4].kind, RowErrorKind::MissingField("latitude"));
        assert_eq!(out.rejected[5].kind, RowErrorKind::NonFinite("avgPM25"));
        assert!(matches!(out.rejected[6].kind, RowErrorKind::Malformed(_)));
        assert_eq!(out.features[2].name, "ok3");
    }

    #[test]
    fn negative_zero_reading_is_stored_as_zero() {
        let out = convert("Quiet,-111.0,40.0,-0.0\n");
        assert!(out.rejected.is_empty());
        let value = out.features[0].avg_pm25;
        assert!(value.is_sign_positive());
        assert_eq!(crate::render::tooltip_text(value), "Avg PM2.5: 0.00");
    }

    #[test]
    fn named_columns_resolve_from_header() {
        let input = "avgPM25,station,lat,lon\n7.5,Hawthorne,40.73,-111.87\n";
        let layout = CsvLayout {
            has_headers: true,
            name: ColumnRef::Name("station".into()),
            longitude: ColumnRef::Name("lon".into()),
            latitude: ColumnRef::Name("lat".into()),
            value: ColumnRef::Name("avgPM25".into()),
        };
        let out = convert_csv_reader(input.as_bytes(), &layout).unwrap();
        assert_eq!(out.features.len(), 1);
        assert_eq!(out.features[0].longitude(), -111.87);
        assert_eq!(out.features[0].latitude(), 40.73);
    }

    #[test]
    fn missing_header_column_fails_whole_file() {
        let input = "name,longitude,latitude\nA,-111.0,40.0\n";
        assert!(convert_csv_reader(input.as_bytes(), &CsvLayout::default()).is_err());
    }

    #[test]
    fn geojson_output_carries_properties() {
        let out = convert("StationA,-111.5,40.2,12.5\n");
        let fc = points_to_geojson(&out.features);
        let json = serde_json::to_value(&fc).unwrap();
        let feature = &json["features"][0];
        assert_eq!(feature["geometry"]["coordinates"], serde_json::json!([-111.5, 40.2]));
        assert_eq!(feature["properties"]["name"], "StationA");
        assert_eq!(feature["properties"]["avgPM25"], 12.5);
    }

    const COUNTIES: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {"type": "Feature", "properties": {"STATEFP": "49", "GEOID": "49035", "NAME": "Salt Lake"},
     "geometry": {"type": "Polygon", "coordinates": [[[-112.0,40.5],[-111.5,40.5],[-111.5,40.9],[-112.0,40.9],[-112.0,40.5]]]}},
    {"type": "Feature", "properties": {"STATEFP": "08", "GEOID": "08031", "NAME": "Denver"},
     "geometry": {"type": "Polygon", "coordinates": [[[-105.1,39.6],[-104.6,39.6],[-104.6,39.9],[-105.1,39.9],[-105.1,39.6]]]}},
    {"type": "Feature", "properties": {"STATEFP": 49, "GEOID": "49049", "NAME": "Utah"},
     "geometry": {"type": "MultiPolygon", "coordinates": [[[[-112.2,39.8],[-111.2,39.8],[-111.2,40.4],[-112.2,40.4],[-112.2,39.8]]]]}},
    {"type": "Feature", "properties": {"STATEFP": 8, "GEOID": "08001", "NAME": "Adams"},
     "geometry": {"type": "Polygon", "coordinates": [[[-105.0,39.7],[-104.0,39.7],[-104.0,40.1],[-105.0,40.1],[-105.0,39.7]]]}},
    {"type": "Feature", "properties": {"STATEFP": "49", "GEOID": "49999", "NAME": "Marker"},
     "geometry": {"type": "Point", "coordinates": [-111.0, 40.0]}}
  ]
}"#;

    #[test]
    fn counties_are_filtered_by_state_code() {
        let counties = load_geojson_counties(COUNTIES.as_bytes(), "49", "NAME").unwrap();
        let names: Vec<_> = counties.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Salt Lake", "Utah"]);
        assert!(counties.iter().all(|c| c.state_fp == "49"));
    }

    #[test]
    fn numeric_state_codes_are_zero_padded() {
        let counties = load_geojson_counties(COUNTIES.as_bytes(), "08", "NAME").unwrap();
        let found: Vec<_> = counties
            .iter()
            .map(|c| (c.id.as_str(), c.state_fp.as_str()))
            .collect();
        assert_eq!(found, [("08031", "08"), ("08001", "08")]);
    }

    #[test]
    fn county_geojson_rejects_bare_geometry() {
        let geometry = r#"{"type": "Point", "coordinates": [0.0, 0.0]}"#;
        assert!(load_geojson_counties(geometry.as_bytes(), "49", "NAME").is_err());
    }

    #[tokio::test]
    async fn async_loaders_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("2020.csv");
        let mut f = File::create(&csv_path).unwrap();
        writeln!(f, "name,longitude,latitude,avgPM25").unwrap();
        writeln!(f, "Rose Park,-111.95,40.80,9.1").unwrap();
        drop(f);

        let county_path = dir.path().join("counties.geojson");
        std::fs::write(&county_path, COUNTIES).unwrap();

        let points = load_points(csv_path, CsvLayout::default()).await.unwrap();
        assert_eq!(points.features.len(), 1);

        let counties = load_counties_async(county_path, "08".into(), "NAME".into())
            .await
            .unwrap();
        assert_eq!(counties.len(), 2);
        assert_eq!(counties[0].id, "08031");
        assert!(counties.iter().all(|c| c.state_fp == "08"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let result = load_points(PathBuf::from("/nonexistent/1999.csv"), CsvLayout::default()).await;
        assert!(result.is_err());
    }
}
