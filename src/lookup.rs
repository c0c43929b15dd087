use crate::render::tooltip_text;
use crate::types::{CountyFeature, PointFeature};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use geo::Point;
use rstar::primitives::GeomWithData;
use rstar::{RTree, RTreeObject, AABB};
use serde::Serialize;

// Wrapper for RTree indexing
struct CountyEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for CountyEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

type StationEntry = GeomWithData<[f64; 2], usize>;

/// Spatial indexes over one map's layers, answering "what is under the cursor".
pub struct MapIndex {
    counties: RTree<CountyEnvelope>,
    stations: RTree<StationEntry>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CountyHit {
    pub index: usize,
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StationHit {
    pub index: usize,
    pub name: String,
    pub longitude: f64,
    pub latitude: f64,
    pub avg_pm25: f64,
    pub tooltip: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Hit {
    pub county: Option<CountyHit>,
    pub station: Option<StationHit>,
}

impl MapIndex {
    pub fn build(counties: &[CountyFeature], points: &[PointFeature]) -> Self {
        let county_items: Vec<CountyEnvelope> = counties
            .iter()
            .enumerate()
            .filter_map(|(index, county)| {
                let rect = county.geometry.bounding_rect()?;
                Some(CountyEnvelope {
                    index,
                    aabb: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();

        let station_items: Vec<StationEntry> = points
            .iter()
            .enumerate()
            .map(|(i, p)| GeomWithData::new([p.longitude(), p.latitude()], i))
            .collect();

        Self {
            counties: RTree::bulk_load(county_items),
            stations: RTree::bulk_load(station_items),
        }
    }

    /// County containing the coordinate, if any.
    pub fn county_at(&self, counties: &[CountyFeature], lon: f64, lat: f64) -> Option<usize> {
        let point = Point::new(lon, lat);
        let envelope = AABB::from_point([lon, lat]);
        self.counties
            .locate_in_envelope_intersecting(&envelope)
            .map(|c| c.index)
            .filter(|&i| counties.get(i).is_some_and(|c| c.geometry.contains(&point)))
            .min()
    }

    pub fn nearest_station(&self, lon: f64, lat: f64) -> Option<usize> {
        self.stations.nearest_neighbor(&[lon, lat]).map(|s| s.data)
    }

    pub fn lookup(
        &self,
        counties: &[CountyFeature],
        points: &[PointFeature],
        lon: f64,
        lat: f64,
    ) -> Hit {
        let county = self
            .county_at(counties, lon, lat)
            .and_then(|i| counties.get(i).map(|c| (i, c)))
            .map(|(index, c)| CountyHit {
                index,
                id: c.id.clone(),
                name: c.name.clone(),
            });

        let station = self
            .nearest_station(lon, lat)
            .and_then(|i| points.get(i).map(|p| (i, p)))
            .map(|(index, p)| StationHit {
                index,
                name: p.name.clone(),
                longitude: p.longitude(),
                latitude: p.latitude(),
                avg_pm25: p.avg_pm25,
                tooltip: tooltip_text(p.avg_pm25),
            });

        Hit { county, station }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, MultiPolygon};

    fn square(id: &str, x0: f64, y0: f64) -> CountyFeature {
        let poly = polygon![
            (x: x0, y: y0),
            (x: x0 + 1.0, y: y0),
            (x: x0 + 1.0, y: y0 + 1.0),
            (x: x0, y: y0 + 1.0),
        ];
        CountyFeature {
            id: id.into(),
            name: format!("County {id}"),
            state_fp: "49".into(),
            geometry: MultiPolygon::new(vec![poly]),
        }
    }

    fn station(name: &str, lon: f64, lat: f64, v: f64) -> PointFeature {
        PointFeature {
            name: name.into(),
            point: Point::new(lon, lat),
            avg_pm25: v,
        }
    }

    #[test]
    fn finds_containing_county_and_nearest_station() {
        let counties = vec![square("a", -112.0, 40.0), square("b", -111.0, 40.0)];
        let points = vec![station("West", -111.8, 40.5, 4.0), station("East", -110.2, 40.5, 11.256)];
        let index = MapIndex::build(&counties, &points);

        let hit = index.lookup(&counties, &points, -110.4, 40.4);
        let county = hit.county.unwrap();
        assert_eq!((county.index, county.id.as_str()), (1, "b"));
        let station = hit.station.unwrap();
        assert_eq!((station.index, station.name.as_str()), (1, "East"));
        assert_eq!(station.tooltip, "Avg PM2.5: 11.26");
    }

    #[test]
    fn outside_every_county_has_no_county_hit() {
        let counties = vec![square("a", -112.0, 40.0)];
        let index = MapIndex::build(&counties, &[]);
        let hit = index.lookup(&counties, &[], -100.0, 30.0);
        assert_eq!(hit, Hit { county: None, station: None });
    }
}
