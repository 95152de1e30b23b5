pub mod device;
pub mod motion;

use std::thread;
use std::time::Duration;

use embedded_hal::i2c::I2c;

pub use device::{DeviceSettings, ImuDevice};
pub use motion::{Calibration, MotionClass, MotionEstimator};

use crate::config::ImuConfig;
use crate::error::TrackerResult;
use crate::types::{current_timestamp, ImuSample};

/// IMU subsystem: the I2C device plus the motion estimator fed from it.
pub struct Imu<I2C> {
    device: ImuDevice<I2C>,
    estimator: MotionEstimator,
    calibration_samples: usize,
    sample_period: Duration,
    last_sample: Option<ImuSample>,
}

impl<I2C: I2c> Imu<I2C> {
    pub fn new(i2c: I2C, config: &ImuConfig) -> Self {
        Self {
            device: ImuDevice::new(i2c, config),
            estimator: MotionEstimator::new(config.motion.clone()),
            calibration_samples: config.calibration_samples,
            sample_period: Duration::from_secs_f64(1.0 / f64::from(config.sample_rate_hz.max(1))),
            last_sample: None,
        }
    }

    pub fn initialize(&mut self) -> TrackerResult<u8> {
        self.device.initialize()
    }

    /// Collect `calibration_samples` readings while the vehicle is assumed
    /// stationary and derive biases and thresholds from them.
    pub fn calibrate(&mut self) -> TrackerResult<Calibration> {
        log::info!(
            "Calibrating IMU with {} samples, keep the vehicle still",
            self.calibration_samples
        );
        let mut samples = Vec::with_capacity(self.calibration_samples);
        for _ in 0..self.calibration_samples {
            samples.push(self.device.read_sample(current_timestamp())?);
            thread::sleep(self.sample_period);
        }
        Ok(self.estimator.calibrate_from(&samples))
    }

    /// Read one sample and feed it to the estimator.
    pub fn poll(&mut self, now: f64) -> TrackerResult<ImuSample> {
        let sample = self.device.read_sample(now)?;
        self.estimator.update(&sample);
        self.last_sample = Some(sample.clone());
        Ok(sample)
    }

    pub fn device(&self) -> &ImuDevice<I2C> {
        &self.device
    }

    pub fn estimator(&self) -> &MotionEstimator {
        &self.estimator
    }

    pub fn estimator_mut(&mut self) -> &mut MotionEstimator {
        &mut self.estimator
    }

    pub fn last_sample(&self) -> Option<&ImuSample> {
        self.last_sample.as_ref()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeBus;
    use super::*;

    #[test]
    fn test_calibrate_and_poll_through_device() {
        let bus = FakeBus::new().with_device(0x68);
        let config = ImuConfig {
            calibration_samples: 5,
            sample_rate_hz: 1000,
            ..ImuConfig::default()
        };
        let mut imu = Imu::new(bus, &config);
        imu.initialize().unwrap();

        let calibration = imu.calibrate().unwrap();
        assert!((calibration.gravity_norm - 1.0).abs() < 1e-9);

        let sample = imu.poll(10.0).unwrap();
        assert_eq!(imu.last_sample(), Some(&sample));
        assert!(imu.estimator().is_stationary());
    }
}
