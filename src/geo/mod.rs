use std::f64::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6_371.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Lat/lng rectangle in degrees with `min_lng <= max_lng`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Rectangles that together cover every point within `radius_km` of
    /// `center`. A circle crossing longitude ±180 yields two rectangles, one
    /// on each side; a circle reaching a pole spans every longitude.
    pub fn covering(center: &GeoPoint, radius_km: f64) -> Vec<BoundingBox> {
        let angular = radius_km.max(0.0) / EARTH_RADIUS_KM;
        let lat = center.lat.to_radians();
        let min_lat = lat - angular;
        let max_lat = lat + angular;

        let full_band = || BoundingBox {
            min_lat: min_lat.to_degrees().max(-90.0),
            max_lat: max_lat.to_degrees().min(90.0),
            min_lng: -180.0,
            max_lng: 180.0,
        };
        if min_lat <= -FRAC_PI_2 || max_lat >= FRAC_PI_2 {
            return vec![full_band()];
        }
        let ratio = angular.sin() / lat.cos();
        if angular >= FRAC_PI_2 || ratio >= 1.0 {
            return vec![full_band()];
        }

        let delta_lng = ratio.asin().to_degrees();
        let (min_lat, max_lat) = (min_lat.to_degrees(), max_lat.to_degrees());
        let band = |min_lng: f64, max_lng: f64| BoundingBox {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        };

        let west = center.lng - delta_lng;
        let east = center.lng + delta_lng;
        if west < -180.0 {
            vec![band(west + 360.0, 180.0), band(-180.0, east)]
        } else if east > 180.0 {
            vec![band(west, 180.0), band(-180.0, east - 360.0)]
        } else {
            vec![band(west, east)]
        }
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lng..=self.max_lng).contains(&point.lng)
    }
}
