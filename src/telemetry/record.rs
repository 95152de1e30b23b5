//! Per-tick telemetry record and the backend wire format.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Detection, GpsFix};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    High,
    Low,
}

/// Position block of a record, either from the receiver or synthesised by
/// dead reckoning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsSnapshot {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub altitude: Option<f64>,
    pub satellites: Option<u32>,
    pub heading: Option<f64>,
    pub dead_reckoning: bool,
    pub accuracy: Accuracy,
}

impl GpsSnapshot {
    pub fn from_fix(fix: &GpsFix) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed: fix.speed,
            altitude: fix.altitude,
            satellites: Some(fix.satellites),
            heading: fix.heading,
            dead_reckoning: false,
            accuracy: Accuracy::High,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuSnapshot {
    pub speed: f64,
    pub heading: f64,
    pub stationary: bool,
    pub filtered_accel: f64,
    pub temperature: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub gps: Option<GpsSnapshot>,
    pub imu: Option<ImuSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detections: Vec<Detection>,
    /// Base64 JPEG of the frame the detections came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// One POST body. `update_type` selects the variant on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "update_type")]
pub enum BackendUpdate {
    #[serde(rename = "position")]
    Telemetry {
        latitude: f64,
        longitude: f64,
        speed: f64,
        timestamp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        satellites: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        altitude: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dead_reckoning: Option<bool>,
    },
    #[serde(rename = "detection")]
    Detection {
        latitude: f64,
        longitude: f64,
        speed: f64,
        timestamp: String,
        sign_type: String,
        confidence: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
}

impl BackendUpdate {
    pub fn is_position(&self) -> bool {
        matches!(self, BackendUpdate::Telemetry { .. })
    }
}

impl TelemetryRecord {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            gps: None,
            imu: None,
            detections: Vec::new(),
            image: None,
        }
    }

    pub fn iso_timestamp(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Backend payloads for this record. Without a position block nothing
    /// can be reported.
    pub fn payloads(&self) -> Vec<BackendUpdate> {
        let Some(gps) = &self.gps else {
            return Vec::new();
        };
        let timestamp = self.iso_timestamp();

        let mut updates = Vec::with_capacity(1 + self.detections.len());
        updates.push(BackendUpdate::Telemetry {
            latitude: gps.latitude,
            longitude: gps.longitude,
            speed: gps.speed,
            timestamp: timestamp.clone(),
            satellites: gps.satellites,
            altitude: gps.altitude,
            dead_reckoning: gps.dead_reckoning.then_some(true),
        });
        for detection in &self.detections {
            updates.push(BackendUpdate::Detection {
                latitude: gps.latitude,
                longitude: gps.longitude,
                speed: gps.speed,
                timestamp: timestamp.clone(),
                sign_type: detection.label.clone(),
                confidence: detection.confidence,
                image: self.image.clone(),
            });
        }
        updates
    }
}
