//! Stationary detection, dead reckoning and GPS blending for the IMU.
//!
//! The estimator keeps two views of motion: a scalar dead-reckoned speed and
//! heading integrated directly from samples, and the Kalman filter state which
//! also carries position in a tangent plane anchored at the last GPS fix.

use serde::Serialize;

use crate::config::MotionConfig;
use crate::filters::kalman::KalmanFilter;
use crate::types::{GpsFix, ImuSample};

pub const STANDARD_GRAVITY: f64 = 9.81;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MotionClass {
    Moving,
    Stationary,
}

/// Result of a stationary calibration run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Calibration {
    pub accel_bias: (f64, f64, f64),
    pub gyro_bias: (f64, f64, f64),
    pub gravity_norm: f64,
    pub motion_threshold: f64,
    pub stationary_threshold: f64,
}

impl Calibration {
    fn uncalibrated(config: &MotionConfig) -> Self {
        Self {
            accel_bias: (0.0, 0.0, 1.0),
            gyro_bias: (0.0, 0.0, 0.0),
            gravity_norm: 1.0,
            motion_threshold: config.min_motion_threshold_g,
            stationary_threshold: config.min_motion_threshold_g * config.stationary_ratio,
        }
    }
}

#[derive(Clone, Debug)]
struct GpsReference {
    latitude: f64,
    longitude: f64,
    speed: f64,
    received_at: f64,
}

pub struct MotionEstimator {
    config: MotionConfig,
    calibration: Calibration,
    kalman: KalmanFilter,
    filtered_accel: f64,
    class: MotionClass,
    stationary_count: u32,
    last_motion_time: Option<f64>,
    last_sample_time: Option<f64>,
    speed: f64,
    heading: f64,
    last_gps: Option<GpsReference>,
}

fn mean(values: impl Iterator<Item = f64>, n: f64) -> f64 {
    values.sum::<f64>() / n
}

impl MotionEstimator {
    pub fn new(config: MotionConfig) -> Self {
        let kalman = KalmanFilter::new(
            config.accel_noise_std,
            config.imu_velocity_std,
            config.gps_velocity_std,
        );
        Self {
            calibration: Calibration::uncalibrated(&config),
            config,
            kalman,
            filtered_accel: 0.0,
            class: MotionClass::Stationary,
            stationary_count: 0,
            last_motion_time: None,
            last_sample_time: None,
            speed: 0.0,
            heading: 0.0,
            last_gps: None,
        }
    }

    /// Derive biases and thresholds from samples taken at rest. An empty
    /// slice leaves the current calibration in place.
    pub fn calibrate_from(&mut self, samples: &[ImuSample]) -> Calibration {
        if samples.is_empty() {
            log::warn!("No calibration samples, keeping previous calibration");
            return self.calibration.clone();
        }
        let n = samples.len() as f64;

        let accel_bias = (
            mean(samples.iter().map(|s| s.accel.0), n),
            mean(samples.iter().map(|s| s.accel.1), n),
            mean(samples.iter().map(|s| s.accel.2), n),
        );
        let gyro_bias = (
            mean(samples.iter().map(|s| s.gyro.0), n),
            mean(samples.iter().map(|s| s.gyro.1), n),
            mean(samples.iter().map(|s| s.gyro.2), n),
        );
        let gravity_norm =
            (accel_bias.0.powi(2) + accel_bias.1.powi(2) + accel_bias.2.powi(2)).sqrt();

        let magnitude_mean = mean(samples.iter().map(ImuSample::accel_magnitude), n);
        let variance = mean(
            samples
                .iter()
                .map(|s| (s.accel_magnitude() - magnitude_mean).powi(2)),
            n,
        );
        let sigma = variance.sqrt();

        let motion_threshold = self
            .config
            .min_motion_threshold_g
            .max(self.config.motion_sigma_factor * sigma);
        let stationary_threshold = self.config.stationary_ratio * motion_threshold;

        self.calibration = Calibration {
            accel_bias,
            gyro_bias,
            gravity_norm,
            motion_threshold,
            stationary_threshold,
        };
        self.filtered_accel = 0.0;
        self.class = MotionClass::Stationary;
        self.stationary_count = 0;
        self.speed = 0.0;
        self.kalman.apply_zupt();

        log::info!(
            "IMU calibrated: gravity={:.4}g, motion>{:.4}g, stationary<{:.4}g (σ={:.4})",
            gravity_norm,
            motion_threshold,
            stationary_threshold,
            sigma
        );
        self.calibration.clone()
    }

    /// Feed one sample. Returns the classification after it.
    pub fn update(&mut self, sample: &ImuSample) -> MotionClass {
        let dt = match self.last_sample_time {
            Some(prev) => (sample.timestamp - prev).clamp(0.0, self.config.max_dt_secs),
            None => 0.0,
        };
        self.last_sample_time = Some(sample.timestamp);

        let deviation = (sample.accel_magnitude() - self.calibration.gravity_norm).abs();
        let alpha = self.config.filter_alpha;
        self.filtered_accel = alpha * deviation + (1.0 - alpha) * self.filtered_accel;

        self.classify(sample.timestamp);

        match self.class {
            MotionClass::Moving => {
                self.speed += self.filtered_accel * STANDARD_GRAVITY * dt;
                self.speed *= (1.0 - self.config.speed_decay_per_sec * dt).max(0.0);
                self.speed = self.speed.min(self.config.max_speed_mps);
            }
            MotionClass::Stationary => self.speed = 0.0,
        }

        let yaw_rate = sample.gyro.2 - self.calibration.gyro_bias.2;
        self.heading = (self.heading + yaw_rate * dt).rem_euclid(360.0);

        let gps_fresh = self.gps_is_fresh(sample.timestamp);
        if !gps_fresh {
            self.kalman.set_heading_deg(self.heading);
        }
        self.kalman.predict(dt);
        if self.class == MotionClass::Moving && !gps_fresh {
            let bias = self.calibration.accel_bias;
            let body = (
                (sample.accel.0 - bias.0) * STANDARD_GRAVITY,
                (sample.accel.1 - bias.1) * STANDARD_GRAVITY,
            );
            self.kalman.update_imu(self.speed, body);
        }

        self.class
    }

    fn classify(&mut self, timestamp: f64) {
        let filtered = self.filtered_accel;
        if filtered > self.calibration.motion_threshold {
            if self.class == MotionClass::Stationary {
                log::debug!("Motion detected (filtered={:.4}g)", filtered);
            }
            self.class = MotionClass::Moving;
            self.stationary_count = 0;
            self.last_motion_time = Some(timestamp);
        } else if filtered < self.calibration.stationary_threshold {
            self.stationary_count = self.stationary_count.saturating_add(1);
            if self.class == MotionClass::Moving
                && self.stationary_count >= self.config.stationary_hysteresis
                && !self.gps_reports_motion(timestamp)
            {
                log::debug!(
                    "Stationary after {} quiet samples",
                    self.stationary_count
                );
                self.enter_stationary();
            }
        } else {
            self.stationary_count = 0;
        }
    }

    fn enter_stationary(&mut self) {
        self.class = MotionClass::Stationary;
        self.speed = 0.0;
        self.kalman.apply_zupt();
    }

    /// Blend a GPS fix into the estimate. Fixes without coordinates are ignored.
    pub fn update_gps(&mut self, fix: &GpsFix, now: f64) {
        if !fix.fix {
            return;
        }
        self.last_gps = Some(GpsReference {
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed: fix.speed,
            received_at: now,
        });
        if let Some(heading) = fix.heading {
            self.heading = heading.rem_euclid(360.0);
        }

        if fix.speed < self.config.gps_stationary_speed_mps {
            if self.class == MotionClass::Moving {
                log::debug!("GPS speed {:.2} m/s, forcing stationary", fix.speed);
            }
            self.stationary_count = self.config.stationary_hysteresis;
            self.enter_stationary();
        } else {
            self.class = MotionClass::Moving;
            self.stationary_count = 0;
            self.last_motion_time = Some(now);
            self.speed = fix.speed.min(self.config.max_speed_mps);
        }

        self.kalman
            .update_gps(fix.latitude, fix.longitude, fix.speed, fix.heading);
    }

    /// A fresh fix above the stationary speed. Constant-velocity cruise
    /// looks like rest to the accelerometer, so this vetoes the quiet-sample
    /// transition.
    fn gps_reports_motion(&self, now: f64) -> bool {
        self.gps_is_fresh(now)
            && self
                .last_gps
                .as_ref()
                .map_or(false, |g| g.speed >= self.config.gps_stationary_speed_mps)
    }

    pub fn gps_is_fresh(&self, now: f64) -> bool {
        self.last_gps
            .as_ref()
            .map_or(false, |g| now - g.received_at < self.config.gps_freshness_secs)
    }

    /// GPS speed while fresh, otherwise the dead-reckoned speed (0 when stationary).
    pub fn get_speed(&self, now: f64) -> f64 {
        match &self.last_gps {
            Some(g) if self.gps_is_fresh(now) => g.speed,
            _ if self.class == MotionClass::Stationary => 0.0,
            _ => self.speed,
        }
    }

    /// GPS position while fresh, otherwise the Kalman dead-reckoned position.
    pub fn get_position(&mut self, now: f64) -> Option<(f64, f64)> {
        match &self.last_gps {
            Some(g) if self.gps_is_fresh(now) => Some((g.latitude, g.longitude)),
            _ => self.kalman.readout_position(),
        }
    }

    pub fn heading(&self) -> f64 {
        self.heading
    }

    pub fn is_stationary(&self) -> bool {
        self.class == MotionClass::Stationary
    }

    pub fn motion_class(&self) -> MotionClass {
        self.class
    }

    pub fn filtered_accel(&self) -> f64 {
        self.filtered_accel
    }

    pub fn stationary_count(&self) -> u32 {
        self.stationary_count
    }

    pub fn last_motion_time(&self) -> Option<f64> {
        self.last_motion_time
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn kalman(&self) -> &KalmanFilter {
        &self.kalman
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(t: f64, accel: (f64, f64, f64)) -> ImuSample {
        ImuSample {
            timestamp: t,
            accel,
            gyro: (0.0, 0.0, 0.0),
            temperature: 30.0,
        }
    }

    /// Gravity on z with a small deterministic wobble.
    fn resting_samples(n: usize) -> Vec<ImuSample> {
        (0..n)
            .map(|i| {
                let noise = 0.004 * ((i as f64) * 1.7).sin();
                sample(i as f64 * 0.01, (0.002, -0.001, 1.0 + noise))
            })
            .collect()
    }

    fn calibrated() -> MotionEstimator {
        let mut est = MotionEstimator::new(MotionConfig::default());
        est.calibrate_from(&resting_samples(100));
        est
    }

    fn gps_fix(speed: f64, heading: Option<f64>) -> GpsFix {
        GpsFix {
            timestamp: 0.0,
            latitude: 14.6,
            longitude: 121.1,
            altitude: None,
            speed,
            heading,
            satellites: 9,
            fix: true,
            raw: String::new(),
        }
    }

    #[test]
    fn test_calibration_on_resting_data() {
        let est = calibrated();
        let cal = est.calibration();
        assert!(cal.gravity_norm >= 0.9 && cal.gravity_norm <= 1.1);
        assert!(cal.motion_threshold >= 0.03);
        assert_relative_eq!(cal.stationary_threshold, 0.3 * cal.motion_threshold);
        assert!(est.is_stationary());
    }

    #[test]
    fn test_noisy_calibration_raises_threshold() {
        let samples: Vec<ImuSample> = (0..100)
            .map(|i| {
                let z = if i % 2 == 0 { 1.05 } else { 0.95 };
                sample(i as f64 * 0.01, (0.0, 0.0, z))
            })
            .collect();
        let mut est = MotionEstimator::new(MotionConfig::default());
        let cal = est.calibrate_from(&samples);
        // σ = 0.05, so 3σ beats the 0.03 floor
        assert_relative_eq!(cal.motion_threshold, 0.15, epsilon = 1e-9);
    }

    #[test]
    fn test_motion_is_detected_immediately() {
        let mut est = calibrated();
        let class = est.update(&sample(10.0, (0.0, 0.6, 1.0)));
        assert_eq!(class, MotionClass::Moving);
        assert_eq!(est.last_motion_time(), Some(10.0));
    }

    #[test]
    fn test_speed_integrates_while_moving_and_is_capped() {
        let mut est = calibrated();
        let mut t = 10.0;
        for _ in 0..50 {
            est.update(&sample(t, (0.0, 0.8, 1.0)));
            t += 0.1;
        }
        let speed = est.get_speed(t);
        assert!(speed > 0.0);
        assert!(speed <= MotionConfig::default().max_speed_mps);
    }

    #[test]
    fn test_hysteresis_then_speed_is_exactly_zero() {
        let mut est = calibrated();
        let mut t = 10.0;
        for _ in 0..20 {
            est.update(&sample(t, (0.0, 0.8, 1.0)));
            t += 0.1;
        }
        assert!(!est.is_stationary());

        // Let the low-pass filter settle below the stationary threshold,
        // then require the full hysteresis run.
        let mut quiet = 0;
        while !est.is_stationary() {
            est.update(&sample(t, (0.002, -0.001, 1.0)));
            t += 0.1;
            quiet += 1;
            assert!(quiet < 200, "never became stationary");
        }
        assert!(est.stationary_count() >= MotionConfig::default().stationary_hysteresis);
        assert_eq!(est.get_speed(t), 0.0);
        assert_eq!(est.kalman().velocity_magnitude(), 0.0);
    }

    #[test]
    fn test_single_quiet_sample_does_not_stop_motion() {
        let mut est = calibrated();
        est.update(&sample(10.0, (0.0, 0.8, 1.0)));
        est.update(&sample(10.1, (0.0, 0.0, 1.0)));
        assert_eq!(est.motion_class(), MotionClass::Moving);
    }

    #[test]
    fn test_heading_integrates_yaw_rate_and_wraps() {
        let mut est = calibrated();
        let mut s = sample(10.0, (0.0, 0.0, 1.0));
        est.update(&s);
        s.timestamp = 10.5;
        s.gyro = (0.0, 0.0, -90.0);
        est.update(&s);
        assert_relative_eq!(est.heading(), 315.0, epsilon = 1e-9);
    }

    #[test]
    fn test_dt_is_clamped() {
        let mut est = calibrated();
        let mut s = sample(10.0, (0.0, 0.0, 1.0));
        est.update(&s);
        s.timestamp = 100.0;
        s.gyro = (0.0, 0.0, 10.0);
        est.update(&s);
        // max_dt = 1s
        assert_relative_eq!(est.heading(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_slow_gps_forces_stationary() {
        let mut est = calibrated();
        est.update(&sample(10.0, (0.0, 0.8, 1.0)));
        assert!(!est.is_stationary());
        est.update_gps(&gps_fix(0.2, None), 10.1);
        assert!(est.is_stationary());
    }

    #[test]
    fn test_fresh_gps_preferred_then_dead_reckoning() {
        let mut est = calibrated();
        est.update_gps(&gps_fix(12.0, Some(90.0)), 100.0);

        assert_eq!(est.get_speed(102.0), 12.0);
        assert_eq!(est.get_position(102.0), Some((14.6, 121.1)));
        assert_relative_eq!(est.heading(), 90.0);

        // Stale: dead reckoning carries the last speed from the same anchor
        assert_eq!(est.get_speed(106.0), 12.0);
        let (lat, lon) = est.get_position(106.0).unwrap();
        assert_relative_eq!(lat, 14.6, epsilon = 1e-9);
        assert_relative_eq!(lon, 121.1, epsilon = 1e-9);

        // Once the IMU settles the estimate is frozen at zero
        let mut t = 106.0;
        while !est.is_stationary() {
            est.update(&sample(t, (0.002, -0.001, 1.0)));
            t += 0.1;
        }
        assert_eq!(est.get_speed(t), 0.0);
    }

    #[test]
    fn test_dead_reckoned_position_moves_along_heading() {
        let mut est = calibrated();
        est.update_gps(&gps_fix(10.0, Some(0.0)), 100.0);

        // Stale GPS, vehicle still moving: the Kalman state carries it north
        let mut t = 106.0;
        for _ in 0..10 {
            est.update(&sample(t, (0.0, 0.8, 1.0)));
            t += 0.1;
        }
        let (lat, _) = est.get_position(t).unwrap();
        assert!(lat > 14.6);
    }

    #[test]
    fn test_cruise_with_fresh_gps_stays_moving() {
        let mut est = calibrated();
        est.update_gps(&gps_fix(20.0, Some(0.0)), 100.0);

        // Constant velocity: the accelerometer sees only gravity
        let mut t = 100.0;
        for _ in 0..30 {
            est.update(&sample(t, (0.002, -0.001, 1.0)));
            t += 0.1;
        }
        assert_eq!(est.motion_class(), MotionClass::Moving);
        assert!(est.stationary_count() >= MotionConfig::default().stationary_hysteresis);
        assert_eq!(est.get_speed(t), 20.0);

        // Once the fix goes stale the quiet run is honoured
        let mut t = 106.0;
        for _ in 0..15 {
            est.update(&sample(t, (0.002, -0.001, 1.0)));
            t += 0.1;
        }
        assert!(est.is_stationary());
    }

    #[test]
    fn test_kalman_imu_update_skipped_while_gps_fresh() {
        let mut est = calibrated();
        est.update_gps(&gps_fix(10.0, Some(0.0)), 100.0);
        let before = est.kalman().get_state().imu_updates;

        let mut t = 100.1;
        for _ in 0..10 {
            est.update(&sample(t, (0.0, 0.8, 1.0)));
            t += 0.1;
        }
        assert_eq!(est.motion_class(), MotionClass::Moving);
        assert_eq!(est.kalman().get_state().imu_updates, before);
    }

    #[test]
    fn test_kalman_imu_update_skipped_while_stationary() {
        let mut est = calibrated();
        let mut t = 10.0;
        for _ in 0..5 {
            est.update(&sample(t, (0.0, 0.8, 1.0)));
            t += 0.1;
        }
        assert_eq!(est.kalman().get_state().imu_updates, 5);

        while !est.is_stationary() {
            est.update(&sample(t, (0.002, -0.001, 1.0)));
            t += 0.1;
        }
        let settled = est.kalman().get_state().imu_updates;
        for _ in 0..20 {
            est.update(&sample(t, (0.002, -0.001, 1.0)));
            t += 0.1;
        }
        assert!(est.is_stationary());
        assert_eq!(est.kalman().get_state().imu_updates, settled);
    }

    #[test]
    fn test_kalman_imu_update_runs_once_gps_is_stale() {
        let mut est = calibrated();
        est.update_gps(&gps_fix(10.0, Some(0.0)), 100.0);

        let mut t = 106.0;
        for _ in 0..10 {
            est.update(&sample(t, (0.0, 0.8, 1.0)));
            t += 0.1;
        }
        assert!(!est.gps_is_fresh(t));
        assert_eq!(est.kalman().get_state().imu_updates, 10);
    }

    #[test]
    fn test_fix_without_coordinates_is_ignored() {
        let mut est = calibrated();
        let mut fix = gps_fix(10.0, None);
        fix.fix = false;
        est.update_gps(&fix, 1.0);
        assert!(!est.gps_is_fresh(1.5));
    }
}
