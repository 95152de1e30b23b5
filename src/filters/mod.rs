pub mod kalman;

pub use kalman::{KalmanFilter, KalmanSnapshot};
