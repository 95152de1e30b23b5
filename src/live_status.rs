//! State shared between the main loop and the background threads.
//!
//! Everything crossing a thread boundary lives in one [`SharedState`] behind a
//! single mutex.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::restart_manager::SensorHealth;
use crate::telemetry::OfflineQueue;
use crate::types::current_timestamp;

/// Cumulative delivery counters, persisted by the usage reporter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageCounters {
    pub bytes_sent: u64,
    pub payloads_sent: u64,
    pub send_failures: u64,
    pub records_queued: u64,
    pub records_flushed: u64,
}

/// Latest view of the tracker, refreshed once per tick.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub started_at: f64,
    pub ticks: u64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub fused_speed: f64,
    pub heading_deg: f64,
    pub stationary: bool,
    pub dead_reckoning: bool,
    pub gps_state: String,
    pub gps_fix: bool,
    pub satellites: Option<u32>,
    pub imu: SensorHealth,
    pub gps: SensorHealth,
    pub kalman_trace: f64,
    pub last_send_ok: Option<bool>,
    pub detections_total: u64,
}

impl LiveStatus {
    pub fn new() -> Self {
        let now = current_timestamp();
        Self {
            timestamp: now,
            started_at: now,
            ticks: 0,
            latitude: None,
            longitude: None,
            fused_speed: 0.0,
            heading_deg: 0.0,
            stationary: true,
            dead_reckoning: false,
            gps_state: "DISCONNECTED".to_string(),
            gps_fix: false,
            satellites: None,
            imu: SensorHealth::default(),
            gps: SensorHealth::default(),
            kalman_trace: 0.0,
            last_send_ok: None,
            detections_total: 0,
        }
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// What `GET /status` returns.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub status: LiveStatus,
    pub queue_depth: usize,
    pub usage: UsageCounters,
}

#[derive(Debug)]
pub struct SharedState {
    pub queue: OfflineQueue,
    pub usage: UsageCounters,
    pub status: LiveStatus,
}

impl SharedState {
    pub fn new(queue: OfflineQueue) -> Self {
        Self {
            queue,
            usage: UsageCounters::default(),
            status: LiveStatus::new(),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let uptime = (current_timestamp() - self.status.started_at).max(0.0);
        StatusSnapshot {
            uptime_seconds: uptime as u64,
            status: self.status.clone(),
            queue_depth: self.queue.len(),
            usage: self.usage.clone(),
        }
    }
}

pub type SharedHandle = Arc<Mutex<SharedState>>;

/// Lock the shared state, recovering the data if another thread panicked
/// while holding it.
pub fn lock_shared(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
