//! Coordinate validation and representative-point extraction for GeoJSON geometry.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

const PLACEHOLDER_EPSILON: f64 = 0.0001;

/// Inclusive lat/lon rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Validation box for a continental-US deployment.
    pub const CONTINENTAL_US: Self = Self {
        min_lat: 24.0,
        max_lat: 50.0,
        min_lon: -125.0,
        max_lon: -66.0,
    };

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }

    /// Parses `min_lon,min_lat,max_lon,max_lat`, the order tile queries use.
    pub fn parse_lon_lat(text: &str) -> Option<Self> {
        let parts = text
            .split(',')
            .map(|p| p.trim().parse::<f64>().ok())
            .collect::<Option<Vec<_>>>()?;
        let [min_lon, min_lat, max_lon, max_lat] = parts.as_slice() else {
            return None;
        };
        if min_lon >= max_lon || min_lat >= max_lat {
            return None;
        }
        Some(Self {
            min_lat: *min_lat,
            max_lat: *max_lat,
            min_lon: *min_lon,
            max_lon: *max_lon,
        })
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::CONTINENTAL_US
    }
}

/// Rejects placeholder, null-island and out-of-region points.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CoordinateValidator {
    bounds: BoundingBox,
}

impl CoordinateValidator {
    pub fn new(bounds: BoundingBox) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    pub fn is_valid(&self, lat: f64, lon: f64) -> bool {
        if !lat.is_finite() || !lon.is_finite() {
            return false;
        }
        if (lat - 1.0).abs() < PLACEHOLDER_EPSILON && (lon - 1.0).abs() < PLACEHOLDER_EPSILON {
            return false;
        }
        if lat == 0.0 && lon == 0.0 {
            return false;
        }
        self.bounds.contains(lat, lon)
    }

    pub fn is_valid_position(&self, position: Position) -> bool {
        self.is_valid(position.lat, position.lon)
    }
}

/// GeoJSON position, longitude first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
}

impl Position {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    fn from_json(value: &JsonValue) -> Option<Self> {
        let pair = value.as_array()?;
        let lon = pair.first()?.as_f64()?;
        let lat = pair.get(1)?.as_f64()?;
        Some(Self { lon, lat })
    }
}

/// Malformed positions are kept as `None` so index-based heuristics still line up.
pub type Line = Vec<Option<Position>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Option<Position>),
    LineString(Line),
    MultiLineString(Vec<Line>),
    Polygon(Vec<Line>),
    MultiPolygon(Vec<Vec<Line>>),
    Unknown(String),
}

impl Geometry {
    /// Lenient reader for a GeoJSON geometry object; `None` when `type` or
    /// `coordinates` is missing.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let kind = value.get("type")?.as_str()?;
        let coordinates = value.get("coordinates")?;
        let geometry = match kind {
            "Point" => Self::Point(Position::from_json(coordinates)),
            "LineString" => Self::LineString(line_from_json(coordinates)),
            "MultiLineString" => Self::MultiLineString(lines_from_json(coordinates)),
            "Polygon" => Self::Polygon(lines_from_json(coordinates)),
            "MultiPolygon" => Self::MultiPolygon(
                coordinates
                    .as_array()
                    .map(|polys| polys.iter().map(lines_from_json).collect())
                    .unwrap_or_default(),
            ),
            other => Self::Unknown(other.to_string()),
        };
        Some(geometry)
    }
}

fn line_from_json(value: &JsonValue) -> Line {
    value
        .as_array()
        .map(|coords| coords.iter().map(Position::from_json).collect())
        .unwrap_or_default()
}

fn lines_from_json(value: &JsonValue) -> Vec<Line> {
    value
        .as_array()
        .map(|lines| lines.iter().map(line_from_json).collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointMethod {
    Point,
    Midpoint,
    FirstValid,
    Centroid,
    RingStart,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepresentativePoint {
    pub position: Position,
    pub method: PointMethod,
}

/// Reduces a geometry to a single validated point.
///
/// Line order of preference is midpoint, then first valid vertex, then the
/// centroid of all well-formed vertices.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryExtractor {
    validator: CoordinateValidator,
}

impl GeometryExtractor {
    pub fn new(validator: CoordinateValidator) -> Self {
        Self { validator }
    }

    pub fn validator(&self) -> &CoordinateValidator {
        &self.validator
    }

    pub fn extract_point_json(&self, geometry: &JsonValue) -> Option<RepresentativePoint> {
        Geometry::from_json(geometry).and_then(|g| self.extract_point(&g))
    }

    pub fn extract_point(&self, geometry: &Geometry) -> Option<RepresentativePoint> {
        match geometry {
            Geometry::Point(position) => {
                let position = (*position).filter(|p| self.validator.is_valid_position(*p))?;
                Some(RepresentativePoint {
                    position,
                    method: PointMethod::Point,
                })
            }
            Geometry::LineString(line) => self.line_point(line),
            Geometry::MultiLineString(lines) => lines.iter().find_map(|line| self.line_point(line)),
            Geometry::Polygon(rings) => self.ring_start(rings.first()),
            Geometry::MultiPolygon(polygons) => {
                self.ring_start(polygons.first().and_then(|rings| rings.first()))
            }
            Geometry::Unknown(_) => None,
        }
    }

    fn line_point(&self, line: &Line) -> Option<RepresentativePoint> {
        if line.is_empty() {
            return None;
        }

        let mid = line[line.len() / 2];
        if let Some(position) = mid.filter(|p| self.validator.is_valid_position(*p)) {
            return Some(RepresentativePoint {
                position,
                method: PointMethod::Midpoint,
            });
        }

        if let Some(position) = line
            .iter()
            .flatten()
            .copied()
            .find(|p| self.validator.is_valid_position(*p))
        {
            return Some(RepresentativePoint {
                position,
                method: PointMethod::FirstValid,
            });
        }

        let (sum_lon, sum_lat, count) = line
            .iter()
            .flatten()
            .fold((0.0, 0.0, 0usize), |(lon, lat, n), p| (lon + p.lon, lat + p.lat, n + 1));
        if count == 0 {
            return None;
        }
        let centroid = Position::new(sum_lon / count as f64, sum_lat / count as f64);
        self.validator
            .is_valid_position(centroid)
            .then_some(RepresentativePoint {
                position: centroid,
                method: PointMethod::Centroid,
            })
    }

    fn ring_start(&self, ring: Option<&Line>) -> Option<RepresentativePoint> {
        let position = ring?
            .first()
            .copied()
            .flatten()
            .filter(|p| self.validator.is_valid_position(*p))?;
        Some(RepresentativePoint {
            position,
            method: PointMethod::RingStart,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> GeometryExtractor {
        GeometryExtractor::default()
    }

    #[test]
    fn validator_rejects_placeholders_and_out_of_bounds() {
        let v = CoordinateValidator::default();
        assert!(!v.is_valid(1.0, 1.0));
        assert!(!v.is_valid(1.00005, 0.99995));
        assert!(!v.is_valid(0.0, 0.0));
        assert!(v.is_valid(39.96, -82.99));
        assert!(!v.is_valid(51.0, -82.99));
        assert!(!v.is_valid(23.9, -82.99));
        assert!(!v.is_valid(39.96, -65.5));
        assert!(!v.is_valid(39.96, -125.01));
        assert!(v.is_valid(39.96, -66.0));
        // Eastern Maine sits just inside the box edge.
        assert!(v.is_valid(39.96, -67.0));
        assert!(!v.is_valid(f64::NAN, -82.99));
    }

    #[test]
    fn validator_honours_custom_bounds() {
        let texas = BoundingBox::parse_lon_lat("-106.7,25.8,-93.5,36.6").unwrap();
        let v = CoordinateValidator::new(texas);
        assert!(v.is_valid(30.27, -97.74));
        assert!(!v.is_valid(39.96, -82.99));
        assert!(BoundingBox::parse_lon_lat("1,2,3").is_none());
        assert!(BoundingBox::parse_lon_lat("-66,24,-125,50").is_none());
    }

    #[test]
    fn point_geometry_must_validate() {
        let ok = json!({"type": "Point", "coordinates": [-83.0, 40.0]});
        let bad = json!({"type": "Point", "coordinates": [1.0, 1.0]});
        let got = extractor().extract_point_json(&ok).unwrap();
        assert_eq!(got.position, Position::new(-83.0, 40.0));
        assert_eq!(got.method, PointMethod::Point);
        assert!(extractor().extract_point_json(&bad).is_none());
    }

    #[test]
    fn line_prefers_midpoint() {
        let g = json!({"type": "LineString", "coordinates": [[-83.0, 40.0], [-83.1, 40.1], [-83.2, 40.2]]});
        let got = extractor().extract_point_json(&g).unwrap();
        assert_eq!(got.position, Position::new(-83.1, 40.1));
        assert_eq!(got.method, PointMethod::Midpoint);
    }

    #[test]
    fn line_falls_back_to_first_valid_vertex() {
        let g = json!({"type": "LineString", "coordinates": [[-83.0, 40.0], [1.0, 1.0], [0.0, 0.0]]});
        let got = extractor().extract_point_json(&g).unwrap();
        assert_eq!(got.position, Position::new(-83.0, 40.0));
        assert_eq!(got.method, PointMethod::FirstValid);
    }

    #[test]
    fn line_falls_back_to_centroid() {
        // Both vertices sit outside the box; their mean lands inside it.
        let g = json!({"type": "LineString", "coordinates": [[-83.0, 20.0], [-83.0, 60.0]]});
        let got = extractor().extract_point_json(&g).unwrap();
        assert_eq!(got.position, Position::new(-83.0, 40.0));
        assert_eq!(got.method, PointMethod::Centroid);
    }

    #[test]
    fn line_without_usable_points_yields_none() {
        let empty = json!({"type": "LineString", "coordinates": []});
        let junk = json!({"type": "LineString", "coordinates": [["a", "b"], [1.0, 1.0]]});
        assert!(extractor().extract_point_json(&empty).is_none());
        assert!(extractor().extract_point_json(&junk).is_none());
    }

    #[test]
    fn multi_line_uses_first_line_that_extracts() {
        let g = json!({
            "type": "MultiLineString",
            "coordinates": [[[1.0, 1.0]], [[-97.7, 30.2], [-97.8, 30.3]]]
        });
        let got = extractor().extract_point_json(&g).unwrap();
        assert_eq!(got.position, Position::new(-97.8, 30.3));
    }

    #[test]
    fn polygons_use_outer_ring_start() {
        let poly = json!({"type": "Polygon", "coordinates": [[[-97.7, 30.2], [-97.8, 30.3], [-97.7, 30.2]]]});
        let multi = json!({"type": "MultiPolygon", "coordinates": [[[[-90.1, 35.0], [-90.2, 35.1]]]]});
        assert_eq!(
            extractor().extract_point_json(&poly).unwrap().position,
            Position::new(-97.7, 30.2)
        );
        let got = extractor().extract_point_json(&multi).unwrap();
        assert_eq!(got.position, Position::new(-90.1, 35.0));
        assert_eq!(got.method, PointMethod::RingStart);
    }

    #[test]
    fn unknown_or_malformed_geometry_yields_none() {
        for g in [
            json!({"type": "GeometryCollection", "coordinates": []}),
            json!({"type": "Point"}),
            json!({"coordinates": [-83.0, 40.0]}),
            json!(null),
            json!({"type": "Polygon", "coordinates": "oops"}),
        ] {
            assert!(extractor().extract_point_json(&g).is_none(), "{g}");
        }
    }
}
