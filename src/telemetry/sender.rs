//! Connectivity probe and retrying HTTP delivery.

use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;

use crate::config::TelemetryConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::telemetry::record::TelemetryRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendMode {
    /// Freshly generated record: position updates are rate-limited.
    Live,
    /// Queued record: everything it carries is sent.
    Backlog,
}

/// What one successful `send_record` put on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub payloads: u32,
    pub bytes: u64,
}

pub struct TelemetrySender {
    config: TelemetryConfig,
    client: Client,
    last_position_sent: Option<f64>,
}

impl TelemetrySender {
    pub fn new(config: TelemetryConfig) -> TrackerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TrackerError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            last_position_sent: None,
        })
    }

    /// TCP connect to the probe host within the configured timeout.
    pub fn check_connectivity(&self) -> TrackerResult<()> {
        let host = &self.config.connectivity_host;
        let port = self.config.connectivity_port;
        let unreachable = |reason: String| TrackerError::NetworkUnreachable {
            host: host.clone(),
            port,
            reason,
        };

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| unreachable(e.to_string()))?
            .next()
            .ok_or_else(|| unreachable("no address resolved".to_string()))?;
        let timeout = Duration::from_millis(self.config.connectivity_timeout_ms);
        TcpStream::connect_timeout(&addr, timeout).map_err(|e| unreachable(e.to_string()))?;
        Ok(())
    }

    fn position_due(&self, now: f64) -> bool {
        self.last_position_sent
            .map_or(true, |last| now - last >= self.config.position_interval_secs)
    }

    /// Whether a fresh record has anything to send right now: a position
    /// outside the rate limit or at least one detection.
    pub fn is_reportable(&self, record: &TelemetryRecord, now: f64) -> bool {
        record.gps.is_some() && (!record.detections.is_empty() || self.position_due(now))
    }

    /// The record went to the offline queue instead of the wire. Its
    /// position still consumes the rate-limit slot.
    pub fn defer(&mut self, record: &TelemetryRecord, now: f64) {
        if record.gps.is_some() && self.position_due(now) {
            self.last_position_sent = Some(now);
        }
    }

    /// POST `body` as JSON with up to `max_retries` attempts and a fixed
    /// backoff between them. Returns the body size on success.
    pub fn post_json<T: Serialize>(&self, url: &str, body: &T) -> TrackerResult<u64> {
        let bytes = serde_json::to_vec(body).map_err(|e| TrackerError::SendFailed {
            attempts: 0,
            reason: format!("serialising payload: {e}"),
        })?;
        let attempts = self.config.max_retries.max(1);
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(bytes.clone())
                .send()
            {
                Ok(resp) if resp.status().is_success() => return Ok(bytes.len() as u64),
                Ok(resp) => reason = format!("HTTP {}", resp.status()),
                Err(e) => reason = e.to_string(),
            }
            log::warn!("POST {} attempt {}/{} failed: {}", url, attempt, attempts, reason);
            if attempt < attempts {
                thread::sleep(backoff);
            }
        }

        Err(TrackerError::SendFailed { attempts, reason })
    }

    /// Deliver a record. In `Live` mode a position update inside the
    /// position interval is skipped; detections always go out.
    pub fn send_record(
        &mut self,
        record: &TelemetryRecord,
        mode: SendMode,
        now: f64,
    ) -> TrackerResult<Delivery> {
        let url = self.config.detection_url();
        let mut delivery = Delivery::default();
        let mut sent_position = false;

        for payload in record.payloads() {
            if payload.is_position() && mode == SendMode::Live && !self.position_due(now) {
                continue;
            }
            delivery.bytes += self.post_json(&url, &payload)?;
            delivery.payloads += 1;
            sent_position |= payload.is_position();
        }

        if sent_position && mode == SendMode::Live {
            self.last_position_sent = Some(now);
        }
        if delivery.payloads > 0 {
            log::debug!(
                "Sent {} payload(s), {} bytes ({:?})",
                delivery.payloads,
                delivery.bytes,
                mode
            );
        }
        Ok(delivery)
    }
}
