//! Linear algebra type system for the fusion filter
//!
//! Compile-time dimension checking and type aliases for the 7-state
//! Kalman filter and its two measurement models.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 7; // [x, y, vx, vy, ax, ay, heading]

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_IMU: usize = 4; // (vx, vy, ax, ay)
pub const MEASURE_DIM_GPS_VEL: usize = 2; // (vx, vy)

// ===== State Types =====
pub type StateVec = SVector<f64, STATE_DIM>;
pub type StateMat = SMatrix<f64, STATE_DIM, STATE_DIM>;

// ===== IMU measurement =====
pub type ImuMeasVec = SVector<f64, MEASURE_DIM_IMU>;
pub type ImuMeasNoise = SMatrix<f64, MEASURE_DIM_IMU, MEASURE_DIM_IMU>;
pub type JacobianImu = SMatrix<f64, MEASURE_DIM_IMU, STATE_DIM>; // 4×7

// ===== GPS velocity measurement =====
pub type GpsVelVec = SVector<f64, MEASURE_DIM_GPS_VEL>;
pub type GpsVelNoise = SMatrix<f64, MEASURE_DIM_GPS_VEL, MEASURE_DIM_GPS_VEL>;
pub type JacobianGpsVel = SMatrix<f64, MEASURE_DIM_GPS_VEL, STATE_DIM>; // 2×7
