use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::RecoveryConfig;

const MAX_COOLDOWN_SECS: f64 = 30.0;

/// Consecutive-failure and re-initialisation bookkeeping for one sensor
#[derive(Clone, Debug)]
pub struct RestartState {
    pub name: String,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub restart_needed: bool,
    pub next_retry_time: Instant,
    pub attempts: u32,
    pub max_attempts: u32,
    pub total_restarts: u32,
    pub base_cooldown: Duration,
    pub current_cooldown: Duration,
}

/// Serializable view for the status surface.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub restart_attempts: u32,
    pub total_restarts: u32,
    pub can_restart: bool,
}

impl RestartState {
    pub fn new(name: &str, config: &RecoveryConfig) -> Self {
        let base_cooldown = Duration::from_secs_f64(config.base_cooldown_secs.max(0.0));
        RestartState {
            name: name.to_string(),
            consecutive_failures: 0,
            failure_threshold: config.failure_threshold.max(1),
            restart_needed: false,
            next_retry_time: Instant::now(),
            attempts: 0,
            max_attempts: config.max_restart_attempts,
            total_restarts: 0,
            base_cooldown,
            current_cooldown: base_cooldown,
        }
    }

    /// A poll succeeded: the sensor is healthy again and any pending
    /// restart is dropped.
    pub fn record_ok(&mut self) {
        if self.restart_needed {
            log::info!("{} recovered without re-initialisation", self.name);
        }
        self.consecutive_failures = 0;
        self.restart_needed = false;
        self.attempts = 0;
        self.current_cooldown = self.base_cooldown;
    }

    /// A poll failed. Once the threshold is reached a restart is signalled.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.restart_needed && self.consecutive_failures >= self.failure_threshold {
            log::warn!(
                "{} failed {} consecutive times, scheduling re-initialisation",
                self.name,
                self.consecutive_failures
            );
            self.restart_needed = true;
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures > 0
    }

    /// Check if enough time has passed for retry
    pub fn can_retry(&self) -> bool {
        Instant::now() >= self.next_retry_time && self.restart_needed
    }

    pub fn can_restart(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn ready_to_restart(&self) -> bool {
        self.can_retry() && self.can_restart()
    }

    /// Multiply cooldown by 1.5 after each failed restart, capped at 30s
    pub fn record_failed_attempt(&mut self) {
        self.attempts += 1;
        self.current_cooldown = Duration::from_secs_f64(
            (self.current_cooldown.as_secs_f64() * 1.5).min(MAX_COOLDOWN_SECS),
        );
        self.next_retry_time = Instant::now() + self.current_cooldown;

        if self.can_restart() {
            log::warn!(
                "{} restart attempt {} failed, next retry in {:.1}s",
                self.name,
                self.attempts,
                self.current_cooldown.as_secs_f64()
            );
        } else {
            log::error!(
                "{} restart attempts exhausted ({}), giving up",
                self.name,
                self.attempts
            );
        }
    }

    pub fn record_success(&mut self) {
        log::info!(
            "{} re-initialised after {} failed attempt(s)",
            self.name,
            self.attempts
        );
        self.restart_needed = false;
        self.consecutive_failures = 0;
        self.attempts = 0;
        self.total_restarts += 1;
        self.current_cooldown = self.base_cooldown;
        self.next_retry_time = Instant::now();
    }

    pub fn health(&self) -> SensorHealth {
        SensorHealth {
            healthy: !self.is_degraded(),
            consecutive_failures: self.consecutive_failures,
            restart_attempts: self.attempts,
            total_restarts: self.total_restarts,
            can_restart: self.can_restart(),
        }
    }

    pub fn status(&self) -> String {
        if !self.restart_needed {
            return if self.is_degraded() {
                format!("{}: DEGRADED ({} failures)", self.name, self.consecutive_failures)
            } else {
                format!("{}: OK", self.name)
            };
        }

        if !self.can_restart() {
            return format!("{}: MAX_ATTEMPTS_EXCEEDED", self.name);
        }

        if !self.can_retry() {
            let wait_time = self
                .next_retry_time
                .saturating_duration_since(Instant::now())
                .as_secs_f64();
            return format!(
                "{}: RESTART_PENDING (waiting {:.1}s, attempt {}/{})",
                self.name, wait_time, self.attempts, self.max_attempts
            );
        }

        format!(
            "{}: READY_TO_RESTART (attempt {}/{})",
            self.name, self.attempts, self.max_attempts
        )
    }
}

/// Restart state for the two sensors the main loop owns
pub struct RestartManager {
    pub imu: RestartState,
    pub gps: RestartState,
}

impl RestartManager {
    pub fn new(config: &RecoveryConfig) -> Self {
        RestartManager {
            imu: RestartState::new("IMU", config),
            gps: RestartState::new("GPS", config),
        }
    }

    pub fn status_report(&self) -> String {
        format!("{} | {}", self.imu.status(), self.gps.status())
    }
}
