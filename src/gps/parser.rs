//! Fix-response parsing for SIMCom-class `+CGNSSINFO` lines.
//!
//! Field offsets differ between firmware revisions, so they are carried in a
//! serde-configurable [`FieldLayout`] instead of being hard-coded.

use serde::{Deserialize, Serialize};

use crate::error::{TrackerError, TrackerResult};
use crate::types::GpsFix;

/// Zero-based comma-field offsets inside the fix response payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldLayout {
    pub satellites: usize,
    pub latitude: usize,
    pub latitude_dir: usize,
    pub longitude: usize,
    pub longitude_dir: usize,
    pub altitude: usize,
    pub speed: usize,
    /// Course over ground; `None` when the firmware does not report it.
    pub course: Option<usize>,
    /// Multiplier applied to the raw speed field to get m/s.
    pub speed_to_mps: f64,
}

impl Default for FieldLayout {
    fn default() -> Self {
        Self {
            satellites: 1,
            latitude: 5,
            latitude_dir: 6,
            longitude: 7,
            longitude_dir: 8,
            altitude: 11,
            speed: 12,
            course: Some(13),
            speed_to_mps: 1.0,
        }
    }
}

impl FieldLayout {
    /// Minimum number of fields needed to locate both coordinates.
    pub fn min_fields(&self) -> usize {
        [
            self.latitude,
            self.latitude_dir,
            self.longitude,
            self.longitude_dir,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 1
    }

    pub fn validate(&self) -> TrackerResult<()> {
        let coords = [
            self.latitude,
            self.latitude_dir,
            self.longitude,
            self.longitude_dir,
        ];
        for (i, a) in coords.iter().enumerate() {
            if coords[i + 1..].contains(a) {
                return Err(TrackerError::Config(format!(
                    "gps.layout coordinate fields must use distinct offsets (offset {a} repeated)"
                )));
            }
        }
        if !self.speed_to_mps.is_finite() || self.speed_to_mps <= 0.0 {
            return Err(TrackerError::Config(format!(
                "gps.layout.speed_to_mps must be positive, got {}",
                self.speed_to_mps
            )));
        }
        Ok(())
    }
}

fn field<'a>(fields: &[&'a str], index: usize) -> Option<&'a str> {
    fields
        .get(index)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

fn parse_coordinate(value: Option<&str>, hemisphere: Option<&str>, negative: &str) -> Option<f64> {
    let magnitude: f64 = value?.parse().ok()?;
    match hemisphere {
        Some(h) if h.eq_ignore_ascii_case(negative) => Some(-magnitude),
        _ => Some(magnitude),
    }
}

/// Parse the first line of `text` carrying `prefix`.
///
/// Returns `None` when no such line exists or it has fewer fields than the
/// layout needs. A line whose latitude or longitude is empty parses to a
/// `GpsFix` with `fix == false`.
pub fn parse_fix_response(
    text: &str,
    prefix: &str,
    layout: &FieldLayout,
    timestamp: f64,
) -> Option<GpsFix> {
    let line = text.lines().map(str::trim).find(|l| l.starts_with(prefix))?;
    let payload = line[prefix.len()..].trim();
    let fields: Vec<&str> = payload.split(',').collect();

    if fields.len() < layout.min_fields() {
        log::debug!(
            "GPS response has {} fields, need {}: {}",
            fields.len(),
            layout.min_fields(),
            line
        );
        return None;
    }

    let latitude = parse_coordinate(
        field(&fields, layout.latitude),
        field(&fields, layout.latitude_dir),
        "S",
    );
    let longitude = parse_coordinate(
        field(&fields, layout.longitude),
        field(&fields, layout.longitude_dir),
        "W",
    );

    let satellites = field(&fields, layout.satellites)
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    let altitude = field(&fields, layout.altitude).and_then(|s| s.parse::<f64>().ok());
    let speed = field(&fields, layout.speed)
        .and_then(|s| s.parse::<f64>().ok())
        .map(|s| s * layout.speed_to_mps)
        .unwrap_or(0.0);
    let heading = layout
        .course
        .and_then(|i| field(&fields, i))
        .and_then(|s| s.parse::<f64>().ok());

    let (fix, latitude, longitude) = match (latitude, longitude) {
        (Some(lat), Some(lon)) => (true, lat, lon),
        _ => (false, 0.0, 0.0),
    };

    Some(GpsFix {
        timestamp,
        latitude,
        longitude,
        altitude,
        speed,
        heading,
        satellites,
        fix,
        raw: line.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const PREFIX: &str = "+CGNSSINFO:";
    const SAMPLE: &str = "+CGNSSINFO: 3,17,,09,10,14.6198673,N,121.1038513,E,120525,112149.00,78.0,0.000,15.78,1.91,0.95,1.6";

    #[test]
    fn test_parse_reference_line() {
        let fix = parse_fix_response(SAMPLE, PREFIX, &FieldLayout::default(), 1.0).unwrap();
        assert!(fix.fix);
        assert_relative_eq!(fix.latitude, 14.6198673);
        assert_relative_eq!(fix.longitude, 121.1038513);
        assert_relative_eq!(fix.speed, 0.0);
        assert_eq!(fix.satellites, 17);
        assert_eq!(fix.altitude, Some(78.0));
        assert_eq!(fix.heading, Some(15.78));
        assert_eq!(fix.raw, SAMPLE);
    }

    #[test]
    fn test_southern_and_western_hemispheres_negate() {
        let south = SAMPLE.replace(",N,", ",S,").replace(",E,", ",W,");
        let fix = parse_fix_response(&south, PREFIX, &FieldLayout::default(), 1.0).unwrap();
        assert_relative_eq!(fix.latitude, -14.6198673);
        assert_relative_eq!(fix.longitude, -121.1038513);
    }

    #[test]
    fn test_finds_prefix_among_echo_and_ok() {
        let text = format!("AT+CGNSSINFO\r\n{SAMPLE}\r\n\r\nOK\r\n");
        let fix = parse_fix_response(&text, PREFIX, &FieldLayout::default(), 1.0).unwrap();
        assert!(fix.fix);
    }

    #[test]
    fn test_empty_coordinates_are_no_fix() {
        let fix = parse_fix_response(
            "+CGNSSINFO: ,,,,,,,,,,,,,,,,",
            PREFIX,
            &FieldLayout::default(),
            1.0,
        )
        .unwrap();
        assert!(!fix.fix);
        assert_eq!(fix.satellites, 0);
    }

    #[test]
    fn test_too_few_fields_is_none() {
        assert!(parse_fix_response("+CGNSSINFO: 3,17,,09", PREFIX, &FieldLayout::default(), 1.0).is_none());
        assert!(parse_fix_response("OK", PREFIX, &FieldLayout::default(), 1.0).is_none());
    }

    #[test]
    fn test_alternate_layout_and_speed_conversion() {
        // Older firmware: lat,N,lon,E,date,time,alt,speed(knots)
        let layout = FieldLayout {
            satellites: 0,
            latitude: 1,
            latitude_dir: 2,
            longitude: 3,
            longitude_dir: 4,
            altitude: 7,
            speed: 8,
            course: None,
            speed_to_mps: 0.514444,
        };
        let fix = parse_fix_response(
            "+CGNSSINFO: 8,1.5,N,103.8,E,010124,000000.0,15.0,10.0",
            PREFIX,
            &layout,
            1.0,
        )
        .unwrap();
        assert!(fix.fix);
        assert_relative_eq!(fix.speed, 5.14444, epsilon = 1e-9);
        assert_eq!(fix.heading, None);
        assert_eq!(fix.satellites, 8);
    }

    #[test]
    fn test_layout_validation() {
        assert!(FieldLayout::default().validate().is_ok());
        assert_eq!(FieldLayout::default().min_fields(), 9);

        let clash = FieldLayout {
            longitude: 5,
            ..FieldLayout::default()
        };
        assert!(clash.validate().is_err());
    }
}
