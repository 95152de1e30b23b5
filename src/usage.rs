//! Periodic data-usage reporting on a background thread.

use std::fs;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use crossbeam::channel::{self, Sender};
use serde::{Deserialize, Serialize};

use crate::config::{TelemetryConfig, UsageConfig};
use crate::error::{TrackerError, TrackerResult};
use crate::live_status::{lock_shared, SharedHandle, UsageCounters};
use crate::telemetry::TelemetrySender;
use crate::types::current_timestamp;

/// Body POSTed to the data-consumption endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionReport {
    pub current_rate: f64,
    pub total_bytes: u64,
}

/// Contents of the usage file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub timestamp: String,
    /// Bytes per second since the previous report.
    pub current_rate: f64,
    pub total_bytes: u64,
    pub counters: UsageCounters,
}

struct Reporter {
    shared: SharedHandle,
    usage_file: PathBuf,
    sender: Option<TelemetrySender>,
    consumption_url: String,
    last_bytes: u64,
    last_time: f64,
}

impl Reporter {
    fn report(&mut self, now: f64) -> TrackerResult<UsageReport> {
        let counters = lock_shared(&self.shared).usage.clone();
        let elapsed = now - self.last_time;
        let delta = counters.bytes_sent.saturating_sub(self.last_bytes);
        let current_rate = if elapsed > 0.0 {
            delta as f64 / elapsed
        } else {
            0.0
        };
        self.last_bytes = counters.bytes_sent;
        self.last_time = now;

        let report = UsageReport {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            current_rate,
            total_bytes: counters.bytes_sent,
            counters,
        };

        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| TrackerError::PersistenceError(e.to_string()))?;
        fs::write(&self.usage_file, json).map_err(|e| {
            TrackerError::PersistenceError(format!("{}: {}", self.usage_file.display(), e))
        })?;

        if let Some(sender) = &self.sender {
            let body = ConsumptionReport {
                current_rate: report.current_rate,
                total_bytes: report.total_bytes,
            };
            if let Err(e) = sender.post_json(&self.consumption_url, &body) {
                log::warn!("Usage report not delivered: {}", e);
            }
        }

        log::debug!(
            "Usage: {} bytes total, {:.1} B/s",
            report.total_bytes,
            report.current_rate
        );
        Ok(report)
    }
}

pub struct UsageHandle {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

impl UsageHandle {
    /// Write a final report and wait for the thread to exit.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.join.join().is_err() {
            log::error!("Usage reporter thread panicked");
        }
    }
}

pub fn spawn(
    config: &UsageConfig,
    telemetry: &TelemetryConfig,
    shared: SharedHandle,
) -> Result<UsageHandle> {
    let sender = if config.post_to_backend {
        Some(TelemetrySender::new(telemetry.clone())?)
    } else {
        None
    };
    let mut reporter = Reporter {
        shared,
        usage_file: PathBuf::from(&config.usage_file),
        sender,
        consumption_url: telemetry.consumption_url(),
        last_bytes: 0,
        last_time: current_timestamp(),
    };
    let interval = Duration::from_secs(config.report_interval_secs.max(1));
    let (stop_tx, stop_rx) = channel::bounded::<()>(1);

    let join = thread::Builder::new()
        .name("usage".to_string())
        .spawn(move || {
            let ticker = channel::tick(interval);
            loop {
                channel::select! {
                    recv(ticker) -> _ => {
                        if let Err(e) = reporter.report(current_timestamp()) {
                            log::error!("Usage report failed: {}", e);
                        }
                    }
                    recv(stop_rx) -> _ => {
                        if let Err(e) = reporter.report(current_timestamp()) {
                            log::error!("Final usage report failed: {}", e);
                        }
                        break;
                    }
                }
            }
        })
        .context("Failed to spawn usage thread")?;

    Ok(UsageHandle {
        stop: stop_tx,
        join,
    })
}
