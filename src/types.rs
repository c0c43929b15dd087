use geo::{MultiPolygon, Point};
use serde::Serialize;

/// One monitoring station reading, converted from a CSV row.
#[derive(Debug, Clone, PartialEq)]
pub struct PointFeature {
    pub name: String,
    // x = longitude, y = latitude
    pub point: Point<f64>,
    pub avg_pm25: f64,
}

impl PointFeature {
    pub fn longitude(&self) -> f64 {
        self.point.x()
    }

    pub fn latitude(&self) -> f64 {
        self.point.y()
    }
}

#[derive(Debug, Clone)]
pub struct CountyFeature {
    pub id: String,
    pub name: String,
    pub state_fp: String,
    pub geometry: MultiPolygon<f64>,
}

/// Value range of a point collection, used as the colour scale domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn of(points: &[PointFeature]) -> Option<Self> {
        points.iter().map(|p| p.avg_pm25).fold(None, |acc, v| match acc {
            None => Some(ValueRange { min: v, max: v }),
            Some(r) => Some(ValueRange {
                min: r.min.min(v),
                max: r.max.max(v),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(v: f64) -> PointFeature {
        PointFeature {
            name: format!("S{v}"),
            point: Point::new(-111.0, 40.0),
            avg_pm25: v,
        }
    }

    #[test]
    fn value_range_spans_collection() {
        let points = vec![feature(8.0), feature(2.5), feature(14.0)];
        let range = ValueRange::of(&points).unwrap();
        assert_eq!(range, ValueRange { min: 2.5, max: 14.0 });
    }

    #[test]
    fn value_range_of_empty_is_none() {
        assert!(ValueRange::of(&[]).is_none());
    }
}
