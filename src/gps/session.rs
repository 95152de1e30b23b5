//! GPS protocol state machine: power-up, mode, AGPS and rate-limited fix polling.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use super::at::{self, AtResponse};
use super::parser::parse_fix_response;
use crate::config::GpsConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::types::GpsFix;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GpsState {
    Disconnected,
    PortOpen,
    Powered,
    ModeConfigured,
    AgpsEnabled,
    FixSearching,
    Fixed,
}

/// Opens a fresh serial handle. Called on connect and on every reconnect.
pub type PortOpener<P> = Box<dyn FnMut() -> TrackerResult<P> + Send>;

/// `min(2^attempt + jitter, cap)` with jitter drawn uniformly from `[0, jitter_secs)`.
pub fn backoff_delay(attempt: u32, jitter_secs: f64, cap_secs: f64) -> Duration {
    let base = 2f64.powi(attempt.min(30) as i32);
    let jitter = if jitter_secs > 0.0 {
        rand::thread_rng().gen_range(0.0..jitter_secs)
    } else {
        0.0
    };
    Duration::from_secs_f64((base + jitter).min(cap_secs).max(0.0))
}

pub struct GpsSession<P: Read + Write> {
    config: GpsConfig,
    opener: PortOpener<P>,
    port: Option<P>,
    state: GpsState,
    power_on: bool,
    agps_enabled: bool,
    last_fix_check: Option<f64>,
    has_fix: bool,
    last_fix: Option<GpsFix>,
    connection_attempts: u32,
}

impl<P: Read + Write> GpsSession<P> {
    pub fn new(config: GpsConfig, opener: PortOpener<P>) -> Self {
        Self {
            config,
            opener,
            port: None,
            state: GpsState::Disconnected,
            power_on: false,
            agps_enabled: false,
            last_fix_check: None,
            has_fix: false,
            last_fix: None,
            connection_attempts: 0,
        }
    }

    pub fn state(&self) -> GpsState {
        self.state
    }

    pub fn is_powered(&self) -> bool {
        self.power_on
    }

    pub fn agps_enabled(&self) -> bool {
        self.agps_enabled
    }

    pub fn has_fix(&self) -> bool {
        self.has_fix
    }

    pub fn last_fix(&self) -> Option<&GpsFix> {
        self.last_fix.as_ref()
    }

    pub fn connection_attempts(&self) -> u32 {
        self.connection_attempts
    }

    pub fn open(&mut self) -> TrackerResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = (self.opener)()?;
        self.port = Some(port);
        self.state = GpsState::PortOpen;
        log::info!("GPS serial port {} opened", self.config.port);
        Ok(())
    }

    fn transaction(
        &mut self,
        command: &str,
        expected: &str,
        timeout_ms: u64,
    ) -> TrackerResult<AtResponse> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TrackerError::Serial("GPS port is not open".to_string()))?;
        at::transaction(port, command, expected, Duration::from_millis(timeout_ms))
    }

    /// Query the power state and switch the receiver on if needed.
    pub fn power_up(&mut self) -> TrackerResult<()> {
        let query = self.config.power_query.clone();
        let powered = self.config.powered_token.clone();
        let power_on = self.config.power_on_command.clone();
        let ready = self.config.ready_token.clone();

        for attempt in 0..self.config.max_power_attempts {
            let status = self.transaction(&query, "OK", self.config.command_timeout_ms)?;
            if status.contains(&powered) {
                log::info!("GPS already powered");
                self.power_on = true;
                self.state = GpsState::Powered;
                return Ok(());
            }

            let resp = self.transaction(&power_on, &ready, self.config.power_timeout_ms)?;
            if resp.matched {
                log::info!("GPS powered on");
                self.power_on = true;
                self.state = GpsState::Powered;
                return Ok(());
            }

            if attempt + 1 < self.config.max_power_attempts {
                let delay = backoff_delay(
                    attempt,
                    self.config.backoff_jitter_secs,
                    self.config.backoff_cap_secs,
                );
                log::warn!(
                    "GPS power-up attempt {}/{} failed, retrying in {:.1}s",
                    attempt + 1,
                    self.config.max_power_attempts,
                    delay.as_secs_f64()
                );
                thread::sleep(delay);
            }
        }

        Err(TrackerError::TransactionTimeout {
            command: power_on,
            expected: ready,
        })
    }

    /// Try each multi-constellation mode command in turn. Firmware that
    /// rejects all of them keeps its default mode. Returns whether one was accepted.
    pub fn configure_mode(&mut self) -> TrackerResult<bool> {
        let commands = self.config.mode_commands.clone();
        for command in &commands {
            let resp = self.transaction(command, "OK", self.config.command_timeout_ms)?;
            if resp.matched {
                log::info!("GPS mode set with {}", command);
                self.state = GpsState::ModeConfigured;
                return Ok(true);
            }
            log::debug!("GPS firmware rejected {}", command);
        }
        log::warn!("No GPS mode command accepted, continuing with default mode");
        self.state = GpsState::ModeConfigured;
        Ok(false)
    }

    /// Request AGPS, wait for it to settle, then look for the success token.
    /// A missing token never blocks progress. Skipped when the module already
    /// reports AGPS as active.
    pub fn enable_agps(&mut self) -> TrackerResult<bool> {
        let query = self.config.agps_status_query.clone();
        let active = self.config.agps_active_token.clone();
        let command = self.config.agps_command.clone();
        let success = self.config.agps_success_token.clone();

        if !query.is_empty() {
            let status = self.transaction(&query, "OK", self.config.command_timeout_ms)?;
            if status.contains(&active) {
                log::info!("AGPS already active");
                self.agps_enabled = true;
                self.state = GpsState::AgpsEnabled;
                return Ok(true);
            }
        }

        let resp = self.transaction(&command, &success, self.config.command_timeout_ms)?;
        let mut enabled = resp.matched;
        if !enabled {
            thread::sleep(Duration::from_millis(self.config.agps_delay_ms));
            let check_timeout = Duration::from_millis(self.config.agps_check_timeout_ms);
            if let Some(port) = self.port.as_mut() {
                enabled = at::read_until(port, &success, check_timeout)?.matched;
            }
        }

        if enabled {
            log::info!("AGPS enabled");
        } else {
            log::warn!("AGPS success not confirmed, continuing without it");
        }
        self.agps_enabled = enabled;
        self.state = GpsState::AgpsEnabled;
        Ok(enabled)
    }

    fn bring_up(&mut self) -> TrackerResult<()> {
        self.open()?;
        self.power_up()?;
        self.configure_mode()?;
        self.enable_agps()?;
        self.state = GpsState::FixSearching;
        Ok(())
    }

    /// Full bring-up with bounded attempts and exponential backoff between them.
    pub fn connect(&mut self) -> TrackerResult<()> {
        let max = self.config.max_connect_attempts.max(1);
        let mut last_err = None;

        for attempt in 0..max {
            self.connection_attempts = attempt + 1;
            match self.bring_up() {
                Ok(()) => {
                    log::info!("GPS connected after {} attempt(s)", attempt + 1);
                    self.connection_attempts = 0;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("GPS connect attempt {}/{} failed: {}", attempt + 1, max, e);
                    self.close();
                    let fatal = e.is_fatal();
                    last_err = Some(e);
                    if fatal {
                        break;
                    }
                    if attempt + 1 < max {
                        thread::sleep(backoff_delay(
                            attempt,
                            self.config.backoff_jitter_secs,
                            self.config.backoff_cap_secs,
                        ));
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TrackerError::Serial("GPS connect not attempted".into())))
    }

    pub fn reconnect(&mut self) -> TrackerResult<()> {
        self.close();
        self.connect()
    }

    fn query_fix(&mut self, now: f64) -> TrackerResult<GpsFix> {
        let command = self.config.fix_command.clone();
        let prefix = self.config.fix_prefix.clone();
        self.last_fix_check = Some(now);

        let resp = self.transaction(&command, &prefix, self.config.command_timeout_ms)?;
        if !resp.matched {
            self.mark_no_fix();
            return Err(TrackerError::TransactionTimeout {
                command,
                expected: prefix,
            });
        }

        match parse_fix_response(&resp.text(), &prefix, &self.config.layout, now) {
            Some(fix) if fix.fix => {
                self.has_fix = true;
                self.state = GpsState::Fixed;
                self.last_fix = Some(fix.clone());
                Ok(fix)
            }
            Some(_) => {
                self.mark_no_fix();
                Err(TrackerError::FixUnavailable("empty coordinates".to_string()))
            }
            None => {
                self.mark_no_fix();
                Err(TrackerError::FixUnavailable(format!(
                    "unparseable response: {}",
                    resp.text()
                )))
            }
        }
    }

    fn mark_no_fix(&mut self) {
        self.has_fix = false;
        if self.state == GpsState::Fixed {
            log::info!("GPS fix lost");
            self.state = GpsState::FixSearching;
        }
    }

    fn within_check_interval(&self, now: f64) -> bool {
        self.last_fix_check
            .map_or(false, |last| now - last < self.config.fix_check_interval_secs)
    }

    /// Rate-limited fix check: within `fix_check_interval_secs` of the previous
    /// check the cached flag is returned without touching the module.
    pub fn check_fix(&mut self, now: f64) -> TrackerResult<bool> {
        if self.within_check_interval(now) {
            return Ok(self.has_fix);
        }
        match self.query_fix(now) {
            Ok(_) => Ok(true),
            Err(TrackerError::FixUnavailable(_)) | Err(TrackerError::TransactionTimeout { .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Query the module for a position. Shares the rate limit with
    /// `check_fix`: inside the interval nothing is sent and `Ok(None)` is
    /// returned, the cached state standing in for a new answer.
    pub fn read_fix(&mut self, now: f64) -> TrackerResult<Option<GpsFix>> {
        if self.within_check_interval(now) {
            return Ok(None);
        }
        self.query_fix(now).map(Some)
    }

    /// Release the serial handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("GPS serial port closed");
        }
        self.state = GpsState::Disconnected;
        self.power_on = false;
        self.agps_enabled = false;
        self.has_fix = false;
        self.last_fix_check = None;
    }
}

impl<P: Read + Write> Drop for GpsSession<P> {
    fn drop(&mut self) {
        self.close();
    }
}
