// src/geopoint.rs

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ParseError;

const EARTH_RADIUS_KM: f64 = 6371.0;
const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Represents a geographical point.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ParseGeoPoint {
    #[serde(rename = "__type")]
    type_field: String, // Should always be "GeoPoint"
    pub latitude: f64,
    pub longitude: f64,
}

impl ParseGeoPoint {
    /// Creates a new `ParseGeoPoint`, rejecting coordinates outside the valid ranges.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ParseError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(ParseError::InvalidInput(format!(
                "latitude {} must be between -90 and 90 degrees",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(ParseError::InvalidInput(format!(
                "longitude {} must be between -180 and 180 degrees",
                longitude
            )));
        }
        Ok(ParseGeoPoint {
            type_field: "GeoPoint".to_string(),
            latitude,
            longitude,
        })
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        let lat = value.get("latitude")?.as_f64()?;
        let lng = value.get("longitude")?.as_f64()?;
        ParseGeoPoint::new(lat, lng).ok()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "__type": "GeoPoint",
            "latitude": self.latitude,
            "longitude": self.longitude,
        })
    }

    /// Great-circle distance in radians (haversine).
    pub fn radians_to(&self, other: &ParseGeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = lat2 - lat1;
        let d_lng = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * a.sqrt().min(1.0).asin()
    }

    pub fn kilometers_to(&self, other: &ParseGeoPoint) -> f64 {
        self.radians_to(other) * EARTH_RADIUS_KM
    }

    pub fn miles_to(&self, other: &ParseGeoPoint) -> f64 {
        self.radians_to(other) * EARTH_RADIUS_MILES
    }

    pub(crate) fn kilometers_to_radians(km: f64) -> f64 {
        km / EARTH_RADIUS_KM
    }

    pub(crate) fn miles_to_radians(miles: f64) -> f64 {
        miles / EARTH_RADIUS_MILES
    }
}

/// A closed polygon of at least three vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsePolygon {
    vertices: Vec<ParseGeoPoint>,
}

impl ParsePolygon {
    pub fn new(vertices: Vec<ParseGeoPoint>) -> Result<Self, ParseError> {
        if vertices.len() < 3 {
            return Err(ParseError::InvalidInput(
                "a polygon needs at least three vertices".to_string(),
            ));
        }
        Ok(ParsePolygon { vertices })
    }

    pub fn vertices(&self) -> &[ParseGeoPoint] {
        &self.vertices
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        let coords = value.get("coordinates")?.as_array()?;
        let vertices = coords
            .iter()
            .map(|pair| {
                let pair = pair.as_array()?;
                ParseGeoPoint::new(pair.first()?.as_f64()?, pair.get(1)?.as_f64()?).ok()
            })
            .collect::<Option<Vec<_>>>()?;
        ParsePolygon::new(vertices).ok()
    }

    pub fn to_json(&self) -> Value {
        let coords: Vec<Value> = self
            .vertices
            .iter()
            .map(|p| json!([p.latitude, p.longitude]))
            .collect();
        json!({ "__type": "Polygon", "coordinates": coords })
    }

    /// Even-odd ray casting over latitude/longitude treated as planar coordinates.
    pub fn contains_point(&self, point: &ParseGeoPoint) -> bool {
        let (min_lat, max_lat, min_lng, max_lng) = self.vertices.iter().fold(
            (f64::MAX, f64::MIN, f64::MAX, f64::MIN),
            |(a, b, c, d), p| {
                (
                    a.min(p.latitude),
                    b.max(p.latitude),
                    c.min(p.longitude),
                    d.max(p.longitude),
                )
            },
        );
        if point.latitude < min_lat
            || point.latitude > max_lat
            || point.longitude < min_lng
            || point.longitude > max_lng
        {
            return false;
        }

        let mut inside = false;
        let n = self.vertices.len();
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = (self.vertices[i].latitude, self.vertices[i].longitude);
            let (xj, yj) = (self.vertices[j].latitude, self.vertices[j].longitude);
            let crosses = (yi > point.longitude) != (yj > point.longitude)
                && point.latitude < (xj - xi) * (point.longitude - yi) / (yj - yi) + xi;
            if crosses {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(ParseGeoPoint::new(91.0, 0.0).is_err());
        assert!(ParseGeoPoint::new(0.0, -181.0).is_err());
    }

    #[test]
    fn distance_between_known_cities() {
        let sf = ParseGeoPoint::new(37.7749, -122.4194).unwrap();
        let la = ParseGeoPoint::new(34.0522, -118.2437).unwrap();
        let km = sf.kilometers_to(&la);
        assert!((km - 559.0).abs() < 5.0, "got {km}");
        assert!(sf.miles_to(&la) < km);
        assert_eq!(sf.radians_to(&sf), 0.0);
    }

    #[test]
    fn polygon_containment() {
        let square = ParsePolygon::new(vec![
            ParseGeoPoint::new(0.0, 0.0).unwrap(),
            ParseGeoPoint::new(0.0, 10.0).unwrap(),
            ParseGeoPoint::new(10.0, 10.0).unwrap(),
            ParseGeoPoint::new(10.0, 0.0).unwrap(),
        ])
        .unwrap();
        assert!(square.contains_point(&ParseGeoPoint::new(5.0, 5.0).unwrap()));
        assert!(!square.contains_point(&ParseGeoPoint::new(15.0, 5.0).unwrap()));
        assert!(ParsePolygon::new(vec![]).is_err());
    }
}
