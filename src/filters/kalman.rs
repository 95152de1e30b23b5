//! 7-state Kalman fusion filter
//!
//! State vector (local tangent plane anchored at the last GPS fix):
//! [0-1]: position x (east), y (north) [m]
//! [2-3]: velocity vx, vy [m/s]
//! [4-5]: acceleration ax, ay [m/s²]
//! [6]:   heading [rad], clockwise from north
//!
//! Predict uses constant-acceleration kinematics. IMU updates observe
//! [vx, vy, ax, ay]; GPS updates observe [vx, vy] and re-anchor the plane.

use nalgebra::{DMatrix, DVector, SMatrix};
use serde::{Deserialize, Serialize};

use crate::types::{
    offset_latlon, GpsVelNoise, GpsVelVec, ImuMeasNoise, ImuMeasVec, JacobianGpsVel, JacobianImu,
    StateMat, StateVec, STATE_DIM,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KalmanSnapshot {
    pub position_local: (f64, f64),
    pub velocity_vector: (f64, f64),
    pub velocity: f64,
    pub acceleration_vector: (f64, f64),
    pub heading_deg: f64,
    pub covariance_trace: f64,
    pub anchor: Option<(f64, f64)>,
    pub gps_updates: u64,
    pub imu_updates: u64,
}

pub struct KalmanFilter {
    state: StateVec,
    covariance: StateMat,
    accel_noise_std: f64,
    r_imu: ImuMeasNoise,
    r_gps: GpsVelNoise,
    anchor: Option<(f64, f64)>,
    gps_update_count: u64,
    imu_update_count: u64,
    predict_count: u64,
}

impl KalmanFilter {
    pub fn new(accel_noise_std: f64, imu_velocity_std: f64, gps_velocity_std: f64) -> Self {
        let imu_vel_var = imu_velocity_std * imu_velocity_std;
        let accel_var = accel_noise_std * accel_noise_std;
        let r_imu = ImuMeasNoise::from_diagonal(&ImuMeasVec::new(
            imu_vel_var,
            imu_vel_var,
            accel_var,
            accel_var,
        ));
        let gps_var = gps_velocity_std * gps_velocity_std;
        let r_gps = GpsVelNoise::from_diagonal(&GpsVelVec::new(gps_var, gps_var));

        Self {
            state: StateVec::zeros(),
            covariance: Self::default_covariance(),
            accel_noise_std,
            r_imu,
            r_gps,
            anchor: None,
            gps_update_count: 0,
            imu_update_count: 0,
            predict_count: 0,
        }
    }

    /// Re-initialise around a known position.
    pub fn reset(&mut self, latitude: f64, longitude: f64) {
        self.state = StateVec::zeros();
        self.covariance = Self::default_covariance();
        self.anchor = Some((latitude, longitude));
    }

    fn default_covariance() -> StateMat {
        let diag = StateVec::from_column_slice(&[100.0, 100.0, 10.0, 10.0, 1.0, 1.0, 0.1]);
        StateMat::from_diagonal(&diag)
    }

    fn build_process_noise(&self, dt: f64) -> StateMat {
        let accel_var = self.accel_noise_std * self.accel_noise_std;
        let q_pos = 0.25 * dt.powi(4) * accel_var;
        let q_vel = dt.powi(2) * accel_var;
        let q_accel = 0.5 * dt;
        let q_heading = 0.01 * dt;
        let diag = StateVec::from_column_slice(&[
            q_pos, q_pos, q_vel, q_vel, q_accel, q_accel, q_heading,
        ]);
        StateMat::from_diagonal(&diag)
    }

    fn build_transition(dt: f64) -> StateMat {
        let dt2 = 0.5 * dt * dt;
        let mut f = StateMat::identity();

        f[(0, 2)] = dt;
        f[(0, 4)] = dt2;

        f[(1, 3)] = dt;
        f[(1, 5)] = dt2;

        f[(2, 4)] = dt;
        f[(3, 5)] = dt;

        f
    }

    fn imu_measurement_jacobian() -> JacobianImu {
        let mut h = JacobianImu::zeros();
        h[(0, 2)] = 1.0;
        h[(1, 3)] = 1.0;
        h[(2, 4)] = 1.0;
        h[(3, 5)] = 1.0;
        h
    }

    fn gps_measurement_jacobian() -> JacobianGpsVel {
        let mut h = JacobianGpsVel::zeros();
        h[(0, 2)] = 1.0;
        h[(1, 3)] = 1.0;
        h
    }

    pub fn predict(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let f = Self::build_transition(dt);
        self.state = f * self.state;
        self.covariance = f * self.covariance * f.transpose() + self.build_process_noise(dt);
        self.predict_count += 1;
    }

    /// Standard Kalman update in Joseph form. Returns false when the
    /// innovation covariance is singular and the update was skipped.
    fn kalman_update(&mut self, h: DMatrix<f64>, residual: DVector<f64>, r: DMatrix<f64>) -> bool {
        let p = DMatrix::from_column_slice(STATE_DIM, STATE_DIM, self.covariance.as_slice());
        let h_t = h.transpose();
        let s = &h * &p * &h_t + &r;
        let Some(s_inv) = s.try_inverse() else {
            log::warn!("Kalman innovation covariance is singular, skipping update");
            return false;
        };
        let k = &p * &h_t * s_inv;
        let dx = &k * residual;

        let identity = DMatrix::<f64>::identity(STATE_DIM, STATE_DIM);
        let i_kh = &identity - &k * &h;
        let new_p = &i_kh * p * i_kh.transpose() + &k * r * k.transpose();

        self.state += StateVec::from_column_slice(dx.as_slice());
        self.covariance = StateMat::from_column_slice(new_p.as_slice());
        true
    }

    /// Fuse a dead-reckoned speed and a body-frame acceleration (m/s²,
    /// x = right, y = forward). Acceleration is rotated into the local frame
    /// using the current heading estimate.
    pub fn update_imu(&mut self, speed: f64, accel_body: (f64, f64)) -> bool {
        let heading = self.state[6];
        let (sin_h, cos_h) = heading.sin_cos();
        let (ax_b, ay_b) = accel_body;
        let ax_east = ax_b * cos_h + ay_b * sin_h;
        let ay_north = -ax_b * sin_h + ay_b * cos_h;

        let z = ImuMeasVec::new(speed * sin_h, speed * cos_h, ax_east, ay_north);
        let h = Self::imu_measurement_jacobian();
        let residual = z - h * self.state;

        let updated = self.kalman_update(
            to_dynamic(&h),
            DVector::from_column_slice(residual.as_slice()),
            to_dynamic(&self.r_imu),
        );
        if updated {
            self.imu_update_count += 1;
        }
        updated
    }

    /// Fuse a GPS velocity and re-anchor the tangent plane at the fix.
    pub fn update_gps(
        &mut self,
        latitude: f64,
        longitude: f64,
        speed: f64,
        heading_deg: Option<f64>,
    ) -> bool {
        if self.anchor.is_none() {
            self.reset(latitude, longitude);
        }

        let heading = heading_deg.map(f64::to_radians).unwrap_or(self.state[6]);
        let (sin_h, cos_h) = heading.sin_cos();
        let z = GpsVelVec::new(speed * sin_h, speed * cos_h);
        let h = Self::gps_measurement_jacobian();
        let residual = z - h * self.state;

        let updated = self.kalman_update(
            to_dynamic(&h),
            DVector::from_column_slice(residual.as_slice()),
            to_dynamic(&self.r_gps),
        );

        self.state[0] = 0.0;
        self.state[1] = 0.0;
        self.anchor = Some((latitude, longitude));
        if heading_deg.is_some() {
            self.state[6] = heading;
        }
        if updated {
            self.gps_update_count += 1;
        }
        updated
    }

    /// Convert the accumulated local offset to lat/lon and re-anchor there.
    pub fn readout_position(&mut self) -> Option<(f64, f64)> {
        let position = self.preview_position()?;
        self.anchor = Some(position);
        self.state[0] = 0.0;
        self.state[1] = 0.0;
        Some(position)
    }

    /// Same conversion as `readout_position` without moving the anchor.
    pub fn preview_position(&self) -> Option<(f64, f64)> {
        let (lat, lon) = self.anchor?;
        Some(offset_latlon(lat, lon, self.state[0], self.state[1]))
    }

    /// Zero Velocity Update: force velocity and acceleration to zero while stationary
    pub fn apply_zupt(&mut self) {
        self.state[2] = 0.0;
        self.state[3] = 0.0;
        self.state[4] = 0.0;
        self.state[5] = 0.0;
    }

    pub fn set_heading_deg(&mut self, heading_deg: f64) {
        self.state[6] = heading_deg.to_radians();
    }

    pub fn heading_deg(&self) -> f64 {
        self.state[6].to_degrees().rem_euclid(360.0)
    }

    pub fn velocity_magnitude(&self) -> f64 {
        (self.state[2] * self.state[2] + self.state[3] * self.state[3]).sqrt()
    }

    pub fn covariance_trace(&self) -> f64 {
        self.covariance.trace()
    }

    pub fn anchor(&self) -> Option<(f64, f64)> {
        self.anchor
    }

    pub fn get_state(&self) -> KalmanSnapshot {
        KalmanSnapshot {
            position_local: (self.state[0], self.state[1]),
            velocity_vector: (self.state[2], self.state[3]),
            velocity: self.velocity_magnitude(),
            acceleration_vector: (self.state[4], self.state[5]),
            heading_deg: self.heading_deg(),
            covariance_trace: self.covariance_trace(),
            anchor: self.anchor,
            gps_updates: self.gps_update_count,
            imu_updates: self.imu_update_count,
        }
    }
}

fn to_dynamic<const R: usize, const C: usize>(m: &SMatrix<f64, R, C>) -> DMatrix<f64> {
    DMatrix::from_column_slice(R, C, m.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn filter() -> KalmanFilter {
        KalmanFilter::new(0.5, 2.0, 0.5)
    }

    #[test]
    fn test_predict_grows_covariance() {
        let mut kf = filter();
        let before = kf.covariance_trace();
        kf.predict(0.1);
        assert!(kf.covariance_trace() > before);
    }

    #[test]
    fn test_predict_constant_acceleration_kinematics() {
        let mut kf = filter();
        kf.state[2] = 2.0; // vx
        kf.state[4] = 1.0; // ax
        kf.predict(2.0);
        // x = v*dt + 0.5*a*dt² = 4 + 2
        assert_relative_eq!(kf.state[0], 6.0, epsilon = 1e-12);
        assert_relative_eq!(kf.state[2], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gps_update_reduces_trace_after_predict() {
        let mut kf = filter();
        kf.reset(14.6, 121.1);
        kf.predict(0.1);
        let predicted_trace = kf.covariance_trace();

        kf.update_gps(14.6, 121.1, 10.0, Some(90.0));
        assert!(kf.covariance_trace() < predicted_trace);
    }

    #[test]
    fn test_imu_update_does_not_increase_trace() {
        let mut kf = filter();
        kf.reset(0.0, 0.0);
        kf.predict(0.1);
        let predicted_trace = kf.covariance_trace();
        assert!(kf.update_imu(3.0, (0.0, 0.5)));
        assert!(kf.covariance_trace() <= predicted_trace);
    }

    #[test]
    fn test_gps_update_reanchors_and_sets_heading() {
        let mut kf = filter();
        kf.reset(10.0, 20.0);
        kf.state[0] = 50.0;
        kf.state[1] = -30.0;

        kf.update_gps(10.001, 20.002, 5.0, Some(180.0));

        assert_eq!(kf.state[0], 0.0);
        assert_eq!(kf.state[1], 0.0);
        assert_eq!(kf.anchor(), Some((10.001, 20.002)));
        assert_relative_eq!(kf.heading_deg(), 180.0, epsilon = 1e-9);
    }

    #[test]
    fn test_gps_velocity_pulls_state_toward_measurement() {
        let mut kf = filter();
        kf.reset(0.0, 0.0);
        kf.update_gps(0.0, 0.0, 10.0, Some(90.0));
        // Heading east: velocity should be mostly +x
        assert!(kf.state[2] > 5.0);
        assert!(kf.state[3].abs() < 1.0);
    }

    #[test]
    fn test_readout_converts_flat_earth_and_reanchors() {
        let mut kf = filter();
        kf.reset(0.0, 0.0);
        kf.state[1] = 111_320.0; // one degree north

        let (lat, lon) = kf.readout_position().unwrap();
        assert_relative_eq!(lat, 1.0, epsilon = 1e-9);
        assert_relative_eq!(lon, 0.0, epsilon = 1e-9);
        assert_eq!(kf.state[1], 0.0);
        assert_eq!(kf.anchor(), Some((lat, lon)));
    }

    #[test]
    fn test_readout_without_anchor_is_none() {
        let mut kf = filter();
        assert!(kf.readout_position().is_none());
    }

    #[test]
    fn test_zupt_zeroes_velocity_terms() {
        let mut kf = filter();
        kf.state[2] = 3.0;
        kf.state[3] = -1.0;
        kf.state[4] = 0.2;
        kf.state[5] = 0.1;
        kf.apply_zupt();
        assert_eq!(kf.velocity_magnitude(), 0.0);
        assert_eq!(kf.get_state().acceleration_vector, (0.0, 0.0));
    }

    #[test]
    fn test_imu_accel_rotated_by_heading() {
        let mut kf = KalmanFilter::new(0.01, 100.0, 0.5);
        kf.reset(0.0, 0.0);
        kf.set_heading_deg(90.0);
        // Forward acceleration while facing east shows up on the east axis
        kf.update_imu(0.0, (0.0, 2.0));
        assert!(kf.state[4] > 1.0);
        assert!(kf.state[5].abs() < 1e-6);
    }
}
