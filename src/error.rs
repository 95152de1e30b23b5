use thiserror::Error;

/// Vehicle tracker error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("No IMU responded at any candidate address {candidates:02x?}")]
    DeviceNotFound { candidates: Vec<u8> },

    #[error("IMU at 0x{address:02x} reported WHO_AM_I 0x{found:02x}, expected 0x{expected:02x}")]
    DeviceVerificationFailed { address: u8, found: u8, expected: u8 },

    #[error("I2C bus error: {0}")]
    Bus(String),

    #[error("Failed to open transport {transport}: {reason}")]
    TransportOpen { transport: String, reason: String },

    #[error("Serial I/O error: {0}")]
    Serial(String),

    #[error("Timed out waiting for '{expected}' after '{command}'")]
    TransactionTimeout { command: String, expected: String },

    #[error("GPS fix unavailable: {0}")]
    FixUnavailable(String),

    #[error("Network unreachable ({host}:{port}): {reason}")]
    NetworkUnreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Send failed after {attempts} attempt(s): {reason}")]
    SendFailed { attempts: u32, reason: String },

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TrackerError {
    /// Only a transport that cannot be opened stops the process; everything else is
    /// recovered by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrackerError::TransportOpen { .. })
    }

    /// Sensor-level errors mark the sensor degraded for the tick.
    pub fn is_sensor_error(&self) -> bool {
        matches!(
            self,
            TrackerError::DeviceNotFound { .. }
                | TrackerError::DeviceVerificationFailed { .. }
                | TrackerError::Bus(_)
                | TrackerError::FixUnavailable(_)
                | TrackerError::TransactionTimeout { .. }
                | TrackerError::Serial(_)
        )
    }

    /// Network errors cause the record to be queued instead of sent.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            TrackerError::NetworkUnreachable { .. } | TrackerError::SendFailed { .. }
        )
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(err: std::io::Error) -> Self {
        TrackerError::Serial(err.to_string())
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;
