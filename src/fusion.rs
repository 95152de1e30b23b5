//! Speed fusion and the dead-reckoning fallback used when GPS is down.

use crate::telemetry::record::{Accuracy, GpsSnapshot};

/// Blend GPS and IMU speed.
///
/// Both present: `alpha·gps + (1−alpha)·imu`. One present: that one.
/// Neither: `last`. When the IMU reports stationary the result is pulled
/// toward zero by `(1−alpha)` and snapped to exactly 0 below `epsilon`.
pub fn fuse_speed(
    gps_speed: Option<f64>,
    imu_speed: Option<f64>,
    imu_stationary: bool,
    last: f64,
    alpha: f64,
    epsilon: f64,
) -> f64 {
    let mut speed = match (gps_speed, imu_speed) {
        (Some(g), Some(i)) => alpha * g + (1.0 - alpha) * i,
        (Some(g), None) => g,
        (None, Some(i)) => i,
        (None, None) => last,
    };

    if imu_stationary {
        speed *= 1.0 - alpha;
        if speed.abs() < epsilon {
            speed = 0.0;
        }
    }
    speed.max(0.0)
}

/// Tracks how long the agent has been substituting dead reckoning for GPS.
#[derive(Debug)]
pub struct DeadReckoningFallback {
    max_duration_secs: f64,
    started_at: Option<f64>,
}

impl DeadReckoningFallback {
    pub fn new(max_duration_secs: f64) -> Self {
        Self {
            max_duration_secs,
            started_at: None,
        }
    }

    /// GPS is back: the next outage starts a fresh window.
    pub fn reset(&mut self) {
        if self.started_at.take().is_some() {
            log::info!("GPS restored, dead reckoning ended");
        }
    }

    pub fn active_since(&self) -> Option<f64> {
        self.started_at
    }

    pub fn elapsed(&self, now: f64) -> f64 {
        self.started_at.map_or(0.0, |start| now - start)
    }

    /// Whether substitution is still allowed at `now`. The first call of an
    /// outage opens the window.
    pub fn is_enabled(&mut self, now: f64) -> bool {
        let start = *self.started_at.get_or_insert_with(|| {
            log::warn!("GPS unavailable, switching to dead reckoning");
            now
        });
        now - start < self.max_duration_secs
    }

    /// A low-accuracy GPS-shaped snapshot from the IMU estimate, or `None`
    /// when there is no position to extrapolate from or the window is spent.
    pub fn synthesize(
        &mut self,
        now: f64,
        position: Option<(f64, f64)>,
        speed: f64,
        heading: f64,
    ) -> Option<GpsSnapshot> {
        let (latitude, longitude) = position?;
        if !self.is_enabled(now) {
            log::debug!(
                "Dead reckoning disabled after {:.0}s (limit {:.0}s)",
                self.elapsed(now),
                self.max_duration_secs
            );
            return None;
        }
        Some(GpsSnapshot {
            latitude,
            longitude,
            speed,
            altitude: None,
            satellites: None,
            heading: Some(heading),
            dead_reckoning: true,
            accuracy: Accuracy::Low,
        })
    }
}
