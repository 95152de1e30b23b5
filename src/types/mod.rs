pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One raw IMU poll: accel in g, gyro in °/s, temperature in °C.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp: f64,
    pub accel: (f64, f64, f64),
    pub gyro: (f64, f64, f64),
    pub temperature: f64,
}

impl ImuSample {
    pub fn accel_magnitude(&self) -> f64 {
        let (x, y, z) = self.accel;
        (x * x + y * y + z * z).sqrt()
    }
}

/// Parsed GPS module response.
///
/// `fix` is true only when both latitude and longitude fields were present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: f64,
    /// Course over ground in degrees, when the firmware reports it.
    pub heading: Option<f64>,
    pub satellites: u32,
    pub fix: bool,
    pub raw: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Output of the sign-detection collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// A captured camera frame, already JPEG-encoded by the capture collaborator.
#[derive(Clone, Debug)]
pub struct Frame {
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Metres per degree of latitude in the flat-Earth approximation.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Offset a lat/lon by local east/north metres (flat-Earth).
pub fn offset_latlon(lat: f64, lon: f64, east_m: f64, north_m: f64) -> (f64, f64) {
    let d_lat = north_m / METERS_PER_DEGREE;
    let d_lon = east_m / (METERS_PER_DEGREE * lat.to_radians().cos());
    (lat + d_lat, lon + d_lon)
}
