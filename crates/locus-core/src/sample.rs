//! Location samples for Locus.
//!
//! A sample is a single position fix produced by a location source. Samples
//! carry their own timestamp; every time comparison in the engine uses it
//! rather than the moment the sample arrived.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A timestamped position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Estimated horizontal accuracy radius in meters.
    pub accuracy_m: f32,
    /// Bearing in degrees, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f32>,
    /// Speed in meters per second, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    /// Fix time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl LocationSample {
    /// Create a new sample.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f32, timestamp_ms: u64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m,
            bearing: None,
            speed: None,
            timestamp_ms,
        }
    }

    /// Attach a bearing.
    #[must_use]
    pub fn with_bearing(mut self, bearing: f32) -> Self {
        self.bearing = Some(bearing);
        self
    }

    /// Attach a speed.
    #[must_use]
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Check that the coordinates are finite and within range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance to another sample in meters.
    #[must_use]
    pub fn distance_to(&self, other: &LocationSample) -> f64 {
        great_circle_distance(self.latitude, self.longitude, other.latitude, other.longitude)
    }

    /// Age of this sample relative to `now_ms`, saturating at zero.
    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }
}

/// Haversine distance between two points given in degrees, in meters.
#[must_use]
pub fn great_circle_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push `a` marginally past 1 for antipodal points.
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}
