use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Convenience alias for UTC DT
pub type UtcDT = DateTime<Utc>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single location measurement as reported by a [crate::LocationProvider]
pub struct Fix {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Estimated horizontal accuracy radius, in meters
    pub accuracy: f32,
    /// When the provider produced this measurement
    pub timestamp: UtcDT,
    /// Name of the source that produced this fix (e.g. "fused", "gps", "network")
    pub provider: String,
    /// Altitude above the WGS84 ellipsoid in meters, if known
    pub altitude: Option<f64>,
    /// Bearing in degrees, if known
    pub bearing: Option<f32>,
    /// Ground speed in meters per second, if known
    pub speed: Option<f32>,
}

impl Fix {
    pub fn new(latitude: f64, longitude: f64, accuracy: f32, provider: impl Into<String>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            timestamp: Utc::now(),
            provider: provider.into(),
            altitude: None,
            bearing: None,
            speed: None,
        }
    }

    /// How old this fix is relative to `now`, negative ages are clamped to zero
    pub fn age(&self, now: UtcDT) -> chrono::Duration {
        (now - self.timestamp).max(chrono::Duration::zero())
    }
}
