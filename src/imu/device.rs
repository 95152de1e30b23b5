//! I2C transport for an ICM-20689 class IMU whose address may float between
//! two candidates.

use std::thread;
use std::time::{Duration, Instant};

use embedded_hal::i2c::{Error as _, I2c};

use crate::config::ImuConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::types::ImuSample;

// Register map
const REG_SMPLRT_DIV: u8 = 0x19;
const REG_CONFIG: u8 = 0x1A;
const REG_GYRO_CONFIG: u8 = 0x1B;
const REG_ACCEL_CONFIG: u8 = 0x1C;
const REG_FIFO_EN: u8 = 0x23;
const REG_ACCEL_XOUT_H: u8 = 0x3B;
const REG_USER_CTRL: u8 = 0x6A;
const REG_PWR_MGMT_1: u8 = 0x6B;
const REG_PWR_MGMT_2: u8 = 0x6C;
const REG_WHO_AM_I: u8 = 0x75;

pub const WHO_AM_I_EXPECTED: u8 = 0x98;

const PWR_RESET: u8 = 0x80;
const PWR_CLK_PLL: u8 = 0x01;
const PWR_ALL_AXES: u8 = 0x00;
const USER_FIFO_RESET: u8 = 0x04;
const USER_FIFO_ENABLE: u8 = 0x40;
const FIFO_ACCEL_GYRO: u8 = 0x78;

const RESET_SETTLE: Duration = Duration::from_millis(100);
const WAKE_SETTLE: Duration = Duration::from_millis(10);

const TEMP_SENSITIVITY: f64 = 326.8;
const TEMP_OFFSET: f64 = 25.0;
const RAW_FULL_SCALE: f64 = 32768.0;

/// Settings last written to the device, after fallback to defaults.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceSettings {
    pub accel_range_g: u16,
    pub gyro_range_dps: u16,
    pub sample_rate_hz: u16,
    pub dlpf: u8,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            accel_range_g: 2,
            gyro_range_dps: 250,
            sample_rate_hz: 100,
            dlpf: 1,
        }
    }
}

fn accel_range_bits(range_g: u16) -> Option<u8> {
    match range_g {
        2 => Some(0),
        4 => Some(1),
        8 => Some(2),
        16 => Some(3),
        _ => None,
    }
}

fn gyro_range_bits(range_dps: u16) -> Option<u8> {
    match range_dps {
        250 => Some(0),
        500 => Some(1),
        1000 => Some(2),
        2000 => Some(3),
        _ => None,
    }
}

fn sample_rate_divider(rate_hz: u16) -> u8 {
    let div = (1000 / u32::from(rate_hz.max(1))).saturating_sub(1);
    div.min(255) as u8
}

fn bus_error<E: embedded_hal::i2c::Error>(err: E) -> TrackerError {
    TrackerError::Bus(format!("{:?}", err.kind()))
}

pub struct ImuDevice<I2C> {
    i2c: I2C,
    candidates: Vec<u8>,
    address: Option<u8>,
    settings: DeviceSettings,
    accel_scale: f64,
    gyro_scale: f64,
    check_interval: Duration,
    last_check: Option<Instant>,
    max_init_attempts: u32,
}

impl<I2C: I2c> ImuDevice<I2C> {
    pub fn new(i2c: I2C, config: &ImuConfig) -> Self {
        let settings = DeviceSettings {
            accel_range_g: config.accel_range_g,
            gyro_range_dps: config.gyro_range_dps,
            sample_rate_hz: config.sample_rate_hz,
            dlpf: config.dlpf,
        };
        Self {
            i2c,
            candidates: config.i2c_addresses.clone(),
            address: None,
            settings,
            accel_scale: 2.0 / RAW_FULL_SCALE,
            gyro_scale: 250.0 / RAW_FULL_SCALE,
            check_interval: Duration::from_secs_f64(config.address_check_interval_secs.max(0.0)),
            last_check: None,
            max_init_attempts: config.max_init_attempts.max(1),
        }
    }

    pub fn address(&self) -> Option<u8> {
        self.address
    }

    pub fn settings(&self) -> DeviceSettings {
        self.settings
    }

    fn read_register(&mut self, address: u8, reg: u8) -> TrackerResult<u8> {
        let mut buf = [0u8; 1];
        self.i2c
            .write_read(address, &[reg], &mut buf)
            .map_err(bus_error)?;
        Ok(buf[0])
    }

    fn write_register(&mut self, address: u8, reg: u8, value: u8) -> TrackerResult<()> {
        self.i2c.write(address, &[reg, value]).map_err(bus_error)
    }

    /// Candidate addresses whose WHO_AM_I matches the expected ID.
    pub fn scan_addresses(&mut self) -> Vec<u8> {
        let mut found = Vec::new();
        for address in self.candidates.clone() {
            match self.read_register(address, REG_WHO_AM_I) {
                Ok(WHO_AM_I_EXPECTED) => found.push(address),
                Ok(other) => log::debug!(
                    "Address 0x{:02x} answered WHO_AM_I 0x{:02x}, ignoring",
                    address,
                    other
                ),
                Err(e) => log::debug!("Address 0x{:02x} did not respond: {}", address, e),
            }
        }
        found
    }

    fn verify_address(&mut self, address: u8) -> TrackerResult<()> {
        let found = self.read_register(address, REG_WHO_AM_I)?;
        if found != WHO_AM_I_EXPECTED {
            return Err(TrackerError::DeviceVerificationFailed {
                address,
                found,
                expected: WHO_AM_I_EXPECTED,
            });
        }
        Ok(())
    }

    pub fn verify_current(&mut self) -> bool {
        match self.address {
            Some(address) => self.verify_address(address).is_ok(),
            None => false,
        }
    }

    /// Rebind to the first valid address if the current one stopped answering.
    /// Returns true when a rescan and reconfiguration happened.
    pub fn switch_if_invalid(&mut self) -> TrackerResult<bool> {
        if self.verify_current() {
            return Ok(false);
        }
        let found = self.scan_addresses();
        let Some(&address) = found.first() else {
            return Err(TrackerError::DeviceNotFound {
                candidates: self.candidates.clone(),
            });
        };
        if self.address != Some(address) {
            log::warn!(
                "IMU moved from {:02x?} to 0x{:02x}, reconfiguring",
                self.address,
                address
            );
        }
        self.address = Some(address);
        let settings = self.settings;
        self.configure(
            settings.accel_range_g,
            settings.gyro_range_dps,
            settings.sample_rate_hz,
            settings.dlpf,
        )?;
        Ok(true)
    }

    /// Reset and program the device at the bound address. Unsupported ranges
    /// fall back to 2 g / 250 °/s and an out-of-range DLPF setting to 1.
    pub fn configure(
        &mut self,
        accel_range_g: u16,
        gyro_range_dps: u16,
        sample_rate_hz: u16,
        dlpf: u8,
    ) -> TrackerResult<()> {
        let address = self.address.ok_or_else(|| TrackerError::DeviceNotFound {
            candidates: self.candidates.clone(),
        })?;

        let (accel_range_g, accel_bits) = match accel_range_bits(accel_range_g) {
            Some(bits) => (accel_range_g, bits),
            None => {
                log::warn!("Unsupported accel range {}g, using 2g", accel_range_g);
                (2, 0)
            }
        };
        let (gyro_range_dps, gyro_bits) = match gyro_range_bits(gyro_range_dps) {
            Some(bits) => (gyro_range_dps, bits),
            None => {
                log::warn!("Unsupported gyro range {}dps, using 250dps", gyro_range_dps);
                (250, 0)
            }
        };
        let dlpf = if dlpf > 7 {
            log::warn!("Unsupported DLPF setting {}, using 1", dlpf);
            1
        } else {
            dlpf
        };

        self.write_register(address, REG_PWR_MGMT_1, PWR_RESET)?;
        thread::sleep(RESET_SETTLE);
        self.write_register(address, REG_PWR_MGMT_1, PWR_CLK_PLL)?;
        thread::sleep(WAKE_SETTLE);
        self.write_register(address, REG_PWR_MGMT_2, PWR_ALL_AXES)?;
        self.write_register(address, REG_CONFIG, dlpf)?;
        self.write_register(address, REG_SMPLRT_DIV, sample_rate_divider(sample_rate_hz))?;
        self.write_register(address, REG_GYRO_CONFIG, gyro_bits << 3)?;
        self.write_register(address, REG_ACCEL_CONFIG, accel_bits << 3)?;
        self.write_register(address, REG_USER_CTRL, USER_FIFO_RESET)?;
        self.write_register(address, REG_USER_CTRL, USER_FIFO_ENABLE)?;
        self.write_register(address, REG_FIFO_EN, FIFO_ACCEL_GYRO)?;

        self.settings = DeviceSettings {
            accel_range_g,
            gyro_range_dps,
            sample_rate_hz,
            dlpf,
        };
        self.accel_scale = f64::from(accel_range_g) / RAW_FULL_SCALE;
        self.gyro_scale = f64::from(gyro_range_dps) / RAW_FULL_SCALE;

        log::info!(
            "IMU configured at 0x{:02x}: ±{}g, ±{}dps, {}Hz, DLPF {}",
            address,
            accel_range_g,
            gyro_range_dps,
            sample_rate_hz,
            dlpf
        );
        Ok(())
    }

    /// Scan, bind, configure and verify, up to `max_init_attempts` times.
    pub fn initialize(&mut self) -> TrackerResult<u8> {
        let mut last_err = TrackerError::DeviceNotFound {
            candidates: self.candidates.clone(),
        };

        for attempt in 1..=self.max_init_attempts {
            let found = self.scan_addresses();
            let Some(&address) = found.first() else {
                log::warn!(
                    "IMU init attempt {}/{}: no device at {:02x?}",
                    attempt,
                    self.max_init_attempts,
                    self.candidates
                );
                last_err = TrackerError::DeviceNotFound {
                    candidates: self.candidates.clone(),
                };
                continue;
            };

            self.address = Some(address);
            let settings = self.settings;
            let result = self
                .configure(
                    settings.accel_range_g,
                    settings.gyro_range_dps,
                    settings.sample_rate_hz,
                    settings.dlpf,
                )
                .and_then(|_| self.verify_address(address));

            match result {
                Ok(()) => {
                    self.last_check = Some(Instant::now());
                    return Ok(address);
                }
                Err(e) => {
                    log::warn!(
                        "IMU init attempt {}/{} failed: {}",
                        attempt,
                        self.max_init_attempts,
                        e
                    );
                    last_err = e;
                }
            }
        }

        self.address = None;
        Err(last_err)
    }

    fn read_raw(&mut self) -> TrackerResult<[i16; 7]> {
        let address = self.address.ok_or_else(|| TrackerError::DeviceNotFound {
            candidates: self.candidates.clone(),
        })?;
        let mut buf = [0u8; 14];
        self.i2c
            .write_read(address, &[REG_ACCEL_XOUT_H], &mut buf)
            .map_err(bus_error)?;

        let mut raw = [0i16; 7];
        for (i, word) in raw.iter_mut().enumerate() {
            *word = i16::from_be_bytes([buf[2 * i], buf[2 * i + 1]]);
        }
        Ok(raw)
    }

    fn convert(&self, raw: [i16; 7], timestamp: f64) -> ImuSample {
        let a = |v: i16| f64::from(v) * self.accel_scale;
        let g = |v: i16| f64::from(v) * self.gyro_scale;
        ImuSample {
            timestamp,
            accel: (a(raw[0]), a(raw[1]), a(raw[2])),
            temperature: f64::from(raw[3]) / TEMP_SENSITIVITY + TEMP_OFFSET,
            gyro: (g(raw[4]), g(raw[5]), g(raw[6])),
        }
    }

    /// Burst-read one sample. The bound address is re-verified at most once
    /// per check interval. A failed read gets one address switch and exactly
    /// one re-read.
    pub fn read_sample(&mut self, timestamp: f64) -> TrackerResult<ImuSample> {
        let due = self
            .last_check
            .map_or(true, |t| t.elapsed() >= self.check_interval);
        if due {
            self.last_check = Some(Instant::now());
            if !self.verify_current() {
                log::warn!("IMU failed periodic WHO_AM_I check");
                self.switch_if_invalid()?;
            }
        }

        match self.read_raw() {
            Ok(raw) => Ok(self.convert(raw, timestamp)),
            Err(first) => {
                log::warn!("IMU read failed ({}), attempting address switch", first);
                self.switch_if_invalid()?;
                let raw = self.read_raw()?;
                Ok(self.convert(raw, timestamp))
            }
        }
    }
}
