use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::gps::parser::FieldLayout;

// ─── IMU ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    pub i2c_bus: u8,
    pub i2c_addresses: Vec<u8>,
    pub accel_range_g: u16,
    pub gyro_range_dps: u16,
    pub sample_rate_hz: u16,
    pub dlpf: u8,
    pub address_check_interval_secs: f64,
    pub max_init_attempts: u32,
    pub calibration_samples: usize,
    pub motion: MotionConfig,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            i2c_bus: 4,
            i2c_addresses: vec![0x68, 0x69],
            accel_range_g: 2,
            gyro_range_dps: 250,
            sample_rate_hz: 100,
            dlpf: 1,
            address_check_interval_secs: 1.0,
            max_init_attempts: 3,
            calibration_samples: 100,
            motion: MotionConfig::default(),
        }
    }
}

/// Tuning for stationary detection and dead reckoning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    // ── Calibration ──
    pub min_motion_threshold_g: f64,
    pub motion_sigma_factor: f64,
    pub stationary_ratio: f64,

    // ── Classification ──
    pub filter_alpha: f64,
    pub stationary_hysteresis: u32,

    // ── Integration ──
    pub speed_decay_per_sec: f64,
    pub max_speed_mps: f64,
    pub max_dt_secs: f64,

    // ── GPS blending ──
    pub gps_freshness_secs: f64,
    pub gps_stationary_speed_mps: f64,

    // ── Kalman noise ──
    pub accel_noise_std: f64,
    pub imu_velocity_std: f64,
    pub gps_velocity_std: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            min_motion_threshold_g: 0.03,
            motion_sigma_factor: 3.0,
            stationary_ratio: 0.3,
            filter_alpha: 0.2,
            stationary_hysteresis: 10,
            speed_decay_per_sec: 0.1,
            max_speed_mps: 33.3,
            max_dt_secs: 1.0,
            gps_freshness_secs: 5.0,
            gps_stationary_speed_mps: 0.5,
            accel_noise_std: 0.5,
            imu_velocity_std: 2.0,
            gps_velocity_std: 0.5,
        }
    }
}

// ─── GPS ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub port: String,
    pub baudrate: u32,
    pub read_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub power_timeout_ms: u64,
    pub agps_delay_ms: u64,
    pub agps_check_timeout_ms: u64,
    pub fix_check_interval_secs: f64,

    // ── Retry / backoff ──
    pub max_power_attempts: u32,
    pub max_connect_attempts: u32,
    pub backoff_jitter_secs: f64,
    pub backoff_cap_secs: f64,

    // ── Firmware tokens ──
    pub power_query: String,
    pub powered_token: String,
    pub power_on_command: String,
    pub ready_token: String,
    pub mode_commands: Vec<String>,
    /// Sent before `agps_command`; empty skips the check.
    pub agps_status_query: String,
    pub agps_active_token: String,
    pub agps_command: String,
    pub agps_success_token: String,
    pub fix_command: String,
    pub fix_prefix: String,

    pub layout: FieldLayout,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB3".to_string(),
            baudrate: 115_200,
            read_timeout_ms: 100,
            command_timeout_ms: 5_000,
            power_timeout_ms: 30_000,
            agps_delay_ms: 5_000,
            agps_check_timeout_ms: 10_000,
            fix_check_interval_secs: 1.0,
            max_power_attempts: 3,
            max_connect_attempts: 5,
            backoff_jitter_secs: 1.0,
            backoff_cap_secs: 30.0,
            power_query: "AT+CGNSSPWR?".to_string(),
            powered_token: "+CGNSSPWR: 1".to_string(),
            power_on_command: "AT+CGNSSPWR=1".to_string(),
            ready_token: "+CGNSSPWR: READY!".to_string(),
            mode_commands: vec!["AT+CGNSSMODE=15".to_string(), "AT+CGNSSMODE=3".to_string()],
            agps_status_query: "AT+CAGPS?".to_string(),
            agps_active_token: "+CAGPS: 1".to_string(),
            agps_command: "AT+CAGPS".to_string(),
            agps_success_token: "+AGPS: success".to_string(),
            fix_command: "AT+CGNSSINFO".to_string(),
            fix_prefix: "+CGNSSINFO:".to_string(),
            layout: FieldLayout::default(),
        }
    }
}

// ─── Fusion ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub speed_alpha: f64,
    pub stationary_epsilon_mps: f64,
    pub max_dead_reckoning_secs: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            speed_alpha: 0.8,
            stationary_epsilon_mps: 0.1,
            max_dead_reckoning_secs: 300.0,
        }
    }
}

// ─── Telemetry ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub backend_url: String,
    pub endpoint_prefix: String,
    pub detection_endpoint: String,
    pub consumption_endpoint: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub position_interval_secs: f64,
    pub connectivity_host: String,
    pub connectivity_port: u16,
    pub connectivity_timeout_ms: u64,
    pub offline_file: String,
    pub send_images: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:5000".to_string(),
            endpoint_prefix: "/api".to_string(),
            detection_endpoint: "/detections".to_string(),
            consumption_endpoint: "/data-consumption".to_string(),
            request_timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 2_000,
            position_interval_secs: 5.0,
            connectivity_host: "8.8.8.8".to_string(),
            connectivity_port: 53,
            connectivity_timeout_ms: 3_000,
            offline_file: "offline_data.json".to_string(),
            send_images: false,
        }
    }
}

impl TelemetryConfig {
    pub fn detection_url(&self) -> String {
        format!(
            "{}{}{}",
            self.backend_url, self.endpoint_prefix, self.detection_endpoint
        )
    }

    pub fn consumption_url(&self) -> String {
        format!(
            "{}{}{}",
            self.backend_url, self.endpoint_prefix, self.consumption_endpoint
        )
    }
}

// ─── Scheduling / background threads ─────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub tick_delay_ms: u64,
    pub imu_interval_secs: f64,
    pub gps_interval_secs: f64,
    pub camera_interval_secs: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_delay_ms: 100,
            imu_interval_secs: 0.1,
            gps_interval_secs: 1.0,
            camera_interval_secs: 1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub report_interval_secs: u64,
    pub usage_file: String,
    pub post_to_backend: bool,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 300,
            usage_file: "data_usage.json".to_string(),
            post_to_backend: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_secs: 5,
        }
    }
}

/// Consecutive-failure handling for sensors after startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub failure_threshold: u32,
    pub max_restart_attempts: u32,
    pub base_cooldown_secs: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            max_restart_attempts: 60,
            base_cooldown_secs: 2.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ─── Root ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub imu: ImuConfig,
    pub gps: GpsConfig,
    pub fusion: FusionConfig,
    pub telemetry: TelemetryConfig,
    pub schedule: ScheduleConfig,
    pub status: StatusConfig,
    pub usage: UsageConfig,
    pub startup: StartupConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
}

impl TrackerConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: TrackerConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.imu.i2c_addresses.is_empty() {
            anyhow::bail!("imu.i2c_addresses must list at least one address");
        }
        if !(0.0..=1.0).contains(&self.fusion.speed_alpha) {
            anyhow::bail!(
                "fusion.speed_alpha must be within [0, 1], got {}",
                self.fusion.speed_alpha
            );
        }
        if !(0.0..=1.0).contains(&self.imu.motion.filter_alpha) {
            anyhow::bail!(
                "imu.motion.filter_alpha must be within [0, 1], got {}",
                self.imu.motion.filter_alpha
            );
        }
        if self.telemetry.max_retries == 0 {
            anyhow::bail!("telemetry.max_retries must be at least 1");
        }
        self.gps
            .layout
            .validate()
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(())
    }
}
