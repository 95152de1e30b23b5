//! Multi-rate tick loop tying sensors, fusion and telemetry together.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::Utc;
use embedded_hal::i2c::I2c;

use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::fusion::{fuse_speed, DeadReckoningFallback};
use crate::gps::GpsSession;
use crate::imu::{Imu, MotionEstimator};
use crate::live_status::{lock_shared, SharedHandle, SharedState};
use crate::restart_manager::RestartManager;
use crate::telemetry::{
    deliver_backlog, GpsSnapshot, ImuSnapshot, OfflineQueue, SendMode, TelemetryRecord,
    TelemetrySender,
};
use crate::types::{current_timestamp, Detection, Frame, GpsFix, ImuSample};

/// The IMU as the loop sees it.
pub trait ImuSource {
    fn poll(&mut self, now: f64) -> TrackerResult<ImuSample>;
    fn reinitialize(&mut self) -> TrackerResult<()>;
    fn estimator(&self) -> &MotionEstimator;
    fn estimator_mut(&mut self) -> &mut MotionEstimator;
}

impl<I2C: I2c> ImuSource for Imu<I2C> {
    fn poll(&mut self, now: f64) -> TrackerResult<ImuSample> {
        Imu::poll(self, now)
    }

    fn reinitialize(&mut self) -> TrackerResult<()> {
        self.initialize().map(|_| ())
    }

    fn estimator(&self) -> &MotionEstimator {
        Imu::estimator(self)
    }

    fn estimator_mut(&mut self) -> &mut MotionEstimator {
        Imu::estimator_mut(self)
    }
}

/// The GPS receiver as the loop sees it.
pub trait GpsSource {
    /// `Ok(None)` when the receiver has nothing new since the last read.
    fn read_fix(&mut self, now: f64) -> TrackerResult<Option<GpsFix>>;
    fn reconnect(&mut self) -> TrackerResult<()>;
    fn close(&mut self);
    fn state_label(&self) -> String;
}

impl<P: Read + Write> GpsSource for GpsSession<P> {
    fn read_fix(&mut self, now: f64) -> TrackerResult<Option<GpsFix>> {
        GpsSession::read_fix(self, now)
    }

    fn reconnect(&mut self) -> TrackerResult<()> {
        GpsSession::reconnect(self)
    }

    fn close(&mut self) {
        GpsSession::close(self)
    }

    fn state_label(&self) -> String {
        format!("{:?}", self.state())
    }
}

/// Camera capture collaborator.
pub trait FrameSource {
    fn capture(&mut self) -> anyhow::Result<Option<Frame>>;
}

/// Sign-detection collaborator.
pub trait SignDetector {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<Detection>>;
}

/// Process-wide state built once at startup and handed to every component
/// that needs it.
#[derive(Clone)]
pub struct TrackerContext {
    pub config: Arc<TrackerConfig>,
    pub shared: SharedHandle,
    pub shutdown: Arc<AtomicBool>,
}

impl TrackerContext {
    pub fn new(config: TrackerConfig, queue: OfflineQueue) -> Self {
        Self {
            config: Arc::new(config),
            shared: Arc::new(Mutex::new(SharedState::new(queue))),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// What happened during one tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub imu_polled: bool,
    pub gps_polled: bool,
    pub camera_polled: bool,
    pub fused_speed: f64,
    pub record: Option<TelemetryRecord>,
    pub sent: bool,
    pub queued: bool,
    pub flushed: usize,
}

fn is_due(last: Option<f64>, interval: f64, now: f64) -> bool {
    last.map_or(true, |t| now - t >= interval)
}

pub struct Orchestrator {
    ctx: TrackerContext,
    imu: Option<Box<dyn ImuSource>>,
    gps: Option<Box<dyn GpsSource>>,
    camera: Option<Box<dyn FrameSource>>,
    detector: Option<Box<dyn SignDetector>>,
    sender: TelemetrySender,
    fallback: DeadReckoningFallback,
    restarts: RestartManager,
    last_imu_poll: Option<f64>,
    last_gps_poll: Option<f64>,
    last_camera_poll: Option<f64>,
    last_imu_sample: Option<ImuSample>,
    last_fix: Option<GpsFix>,
    last_speed: f64,
    ticks: u64,
}

impl Orchestrator {
    pub fn new(ctx: TrackerContext, sender: TelemetrySender) -> Self {
        let fallback = DeadReckoningFallback::new(ctx.config.fusion.max_dead_reckoning_secs);
        let restarts = RestartManager::new(&ctx.config.recovery);
        Self {
            ctx,
            imu: None,
            gps: None,
            camera: None,
            detector: None,
            sender,
            fallback,
            restarts,
            last_imu_poll: None,
            last_gps_poll: None,
            last_camera_poll: None,
            last_imu_sample: None,
            last_fix: None,
            last_speed: 0.0,
            ticks: 0,
        }
    }

    pub fn with_imu(mut self, imu: Box<dyn ImuSource>) -> Self {
        self.imu = Some(imu);
        self
    }

    pub fn with_gps(mut self, gps: Box<dyn GpsSource>) -> Self {
        self.gps = Some(gps);
        self
    }

    pub fn with_camera(mut self, camera: Box<dyn FrameSource>, detector: Box<dyn SignDetector>) -> Self {
        self.camera = Some(camera);
        self.detector = Some(detector);
        self
    }

    pub fn restarts(&self) -> &RestartManager {
        &self.restarts
    }

    fn poll_imu(&mut self, now: f64) -> bool {
        let Some(imu) = self.imu.as_mut() else {
            return false;
        };
        if !is_due(self.last_imu_poll, self.ctx.config.schedule.imu_interval_secs, now) {
            return false;
        }
        self.last_imu_poll = Some(now);

        match imu.poll(now) {
            Ok(sample) => {
                self.restarts.imu.record_ok();
                self.last_imu_sample = Some(sample);
            }
            Err(e) => {
                log::warn!("IMU read failed: {}", e);
                self.restarts.imu.record_failure();
            }
        }

        if self.restarts.imu.ready_to_restart() {
            log::info!("Re-initialising IMU");
            match imu.reinitialize() {
                Ok(()) => self.restarts.imu.record_success(),
                Err(e) => {
                    log::warn!("IMU re-initialisation failed: {}", e);
                    self.restarts.imu.record_failed_attempt();
                }
            }
        }
        true
    }

    fn poll_gps(&mut self, now: f64) -> bool {
        let Some(gps) = self.gps.as_mut() else {
            return false;
        };
        if !is_due(self.last_gps_poll, self.ctx.config.schedule.gps_interval_secs, now) {
            return false;
        }
        self.last_gps_poll = Some(now);

        match gps.read_fix(now) {
            Ok(None) => {}
            Ok(Some(fix)) => {
                self.restarts.gps.record_ok();
                if let Some(imu) = self.imu.as_mut() {
                    imu.estimator_mut().update_gps(&fix, now);
                }
                self.fallback.reset();
                self.last_fix = Some(fix);
            }
            Err(e) => {
                match &e {
                    TrackerError::FixUnavailable(_) => log::debug!("No GPS fix: {}", e),
                    _ => log::warn!("GPS read failed: {}", e),
                }
                self.restarts.gps.record_failure();
            }
        }

        if self.restarts.gps.ready_to_restart() {
            log::info!("Reconnecting GPS");
            match gps.reconnect() {
                Ok(()) => self.restarts.gps.record_success(),
                Err(e) => {
                    log::warn!("GPS reconnect failed: {}", e);
                    self.restarts.gps.record_failed_attempt();
                }
            }
        }
        true
    }

    /// Capture and detect. Any collaborator failure means no detections.
    fn poll_camera(&mut self, now: f64) -> Option<(Vec<Detection>, Option<String>)> {
        let (Some(camera), Some(detector)) = (self.camera.as_mut(), self.detector.as_mut()) else {
            return None;
        };
        if !is_due(self.last_camera_poll, self.ctx.config.schedule.camera_interval_secs, now) {
            return None;
        }
        self.last_camera_poll = Some(now);

        let frame = match camera.capture() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Some((Vec::new(), None)),
            Err(e) => {
                log::warn!("Frame capture failed: {:#}", e);
                return Some((Vec::new(), None));
            }
        };
        let detections = match detector.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("Sign detection failed: {:#}", e);
                Vec::new()
            }
        };
        let image = (self.ctx.config.telemetry.send_images && !detections.is_empty())
            .then(|| base64::engine::general_purpose::STANDARD.encode(&frame.jpeg));
        Some((detections, image))
    }

    /// The last fix, if it is recent enough to count as live GPS.
    fn current_fix(&self, now: f64) -> Option<&GpsFix> {
        let freshness = self.ctx.config.imu.motion.gps_freshness_secs;
        self.last_fix
            .as_ref()
            .filter(|fix| fix.fix && now - fix.timestamp < freshness)
    }

    fn build_record(&mut self, now: f64, detections: Vec<Detection>, image: Option<String>) -> TelemetryRecord {
        let fusion = &self.ctx.config.fusion;
        let imu_healthy = !self.restarts.imu.restart_needed;

        let gps_speed = self.current_fix(now).map(|f| f.speed);
        let (imu_speed, stationary) = match self.imu.as_ref() {
            Some(imu) if imu_healthy => {
                let est = imu.estimator();
                (Some(est.get_speed(now)), est.is_stationary())
            }
            _ => (None, false),
        };
        self.last_speed = fuse_speed(
            gps_speed,
            imu_speed,
            stationary,
            self.last_speed,
            fusion.speed_alpha,
            fusion.stationary_epsilon_mps,
        );

        let mut record = TelemetryRecord::new(Utc::now());
        let live_gps = self.current_fix(now).map(GpsSnapshot::from_fix);
        record.gps = match live_gps {
            Some(mut snapshot) => {
                snapshot.speed = self.last_speed;
                Some(snapshot)
            }
            None => match self.imu.as_mut() {
                Some(imu) if imu_healthy => {
                    let heading = imu.estimator().heading();
                    let position = imu.estimator_mut().get_position(now);
                    self.fallback
                        .synthesize(now, position, self.last_speed, heading)
                }
                _ => None,
            },
        };

        if let (Some(imu), Some(sample)) = (self.imu.as_ref(), self.last_imu_sample.as_ref()) {
            let est = imu.estimator();
            record.imu = Some(ImuSnapshot {
                speed: est.get_speed(now),
                heading: est.heading(),
                stationary: est.is_stationary(),
                filtered_accel: est.filtered_accel(),
                temperature: sample.temperature,
            });
        }
        record.detections = detections;
        record.image = image;
        record
    }

    /// Send the fresh record, or queue it when offline or delivery fails.
    fn deliver(&mut self, record: &TelemetryRecord, now: f64, online: bool, report: &mut TickReport) {
        if online {
            match self.sender.send_record(record, SendMode::Live, now) {
                Ok(delivery) => {
                    let mut shared = lock_shared(&self.ctx.shared);
                    shared.usage.bytes_sent += delivery.bytes;
                    shared.usage.payloads_sent += u64::from(delivery.payloads);
                    shared.status.last_send_ok = Some(true);
                    report.sent = delivery.payloads > 0;
                    return;
                }
                Err(e) => log::warn!("Telemetry send failed, queueing: {}", e),
            }
        }

        self.sender.defer(record, now);
        let mut shared = lock_shared(&self.ctx.shared);
        if online {
            shared.usage.send_failures += 1;
            shared.status.last_send_ok = Some(false);
        }
        shared.usage.records_queued += 1;
        if let Err(e) = shared.queue.push(record.clone()) {
            log::error!("{}", e);
        }
        report.queued = true;
    }

    /// Retry every queued record, keeping the failures in order.
    fn flush_backlog(&mut self, now: f64) -> usize {
        let backlog = lock_shared(&self.ctx.shared).queue.take_all();
        if backlog.is_empty() {
            return 0;
        }
        let total = backlog.len();
        let sender = &mut self.sender;
        let (delivered, failed) =
            deliver_backlog(backlog, |record| sender.send_record(record, SendMode::Backlog, now));

        let mut shared = lock_shared(&self.ctx.shared);
        for delivery in &delivered {
            shared.usage.bytes_sent += delivery.bytes;
            shared.usage.payloads_sent += u64::from(delivery.payloads);
        }
        shared.usage.records_flushed += delivered.len() as u64;
        if let Err(e) = shared.queue.requeue_front(failed) {
            log::error!("{}", e);
        }
        if !delivered.is_empty() {
            log::info!("Flushed {}/{} queued record(s)", delivered.len(), total);
        }
        delivered.len()
    }

    fn publish_status(&mut self, now: f64, report: &TickReport) {
        let position = report
            .record
            .as_ref()
            .and_then(|r| r.gps.as_ref())
            .map(|g| (g.latitude, g.longitude, g.dead_reckoning, g.satellites));
        let (heading, stationary, trace) = match self.imu.as_ref() {
            Some(imu) => {
                let est = imu.estimator();
                (est.heading(), est.is_stationary(), est.kalman().covariance_trace())
            }
            None => (0.0, false, 0.0),
        };
        let gps_state = self
            .gps
            .as_ref()
            .map_or_else(|| "ABSENT".to_string(), |g| g.state_label());
        let gps_fix = self.current_fix(now).is_some();
        let detections = report
            .record
            .as_ref()
            .map_or(0, |r| r.detections.len() as u64);

        let mut shared = lock_shared(&self.ctx.shared);
        let status = &mut shared.status;
        status.timestamp = current_timestamp();
        status.ticks = self.ticks;
        if let Some((lat, lon, dead_reckoning, satellites)) = position {
            status.latitude = Some(lat);
            status.longitude = Some(lon);
            status.dead_reckoning = dead_reckoning;
            status.satellites = satellites;
        }
        status.fused_speed = report.fused_speed;
        status.heading_deg = heading;
        status.stationary = stationary;
        status.gps_state = gps_state;
        status.gps_fix = gps_fix;
        status.imu = self.restarts.imu.health();
        status.gps = self.restarts.gps.health();
        status.kalman_trace = trace;
        status.detections_total += detections;
    }

    /// One pass of the loop. `now` is wall-clock seconds.
    pub fn tick(&mut self, now: f64) -> TickReport {
        self.ticks += 1;
        let mut report = TickReport {
            imu_polled: self.poll_imu(now),
            gps_polled: self.poll_gps(now),
            ..TickReport::default()
        };

        let (detections, image) = match self.poll_camera(now) {
            Some(result) => {
                report.camera_polled = true;
                result
            }
            None => (Vec::new(), None),
        };

        let record = self.build_record(now, detections, image);
        report.fused_speed = self.last_speed;

        let reportable = self.sender.is_reportable(&record, now);
        let has_backlog = !lock_shared(&self.ctx.shared).queue.is_empty();
        if reportable || has_backlog {
            let online = match self.sender.check_connectivity() {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("{}", e);
                    false
                }
            };
            if reportable {
                self.deliver(&record, now, online, &mut report);
            }
            if online && has_backlog {
                report.flushed = self.flush_backlog(now);
            }
        }

        report.record = Some(record);
        self.publish_status(now, &report);
        report
    }

    /// Tick until shutdown is requested or `duration` elapses.
    pub fn run(&mut self, duration: Option<Duration>) {
        let started = Instant::now();
        let tick_delay = Duration::from_millis(self.ctx.config.schedule.tick_delay_ms);
        log::info!("Main loop started");

        while !self.ctx.shutdown_requested() {
            if duration.is_some_and(|d| started.elapsed() >= d) {
                log::info!("Run duration reached");
                break;
            }
            let report = self.tick(current_timestamp());
            if self.ticks % 100 == 0 {
                log::debug!(
                    "tick {}: speed {:.2} m/s, {}",
                    self.ticks,
                    report.fused_speed,
                    self.restarts.status_report()
                );
            }
            thread::sleep(tick_delay);
        }
        self.shutdown();
    }

    /// Close the GPS and persist the backlog.
    pub fn shutdown(&mut self) {
        if let Some(gps) = self.gps.as_mut() {
            gps.close();
        }
        let shared = lock_shared(&self.ctx.shared);
        match shared.queue.persist() {
            Ok(()) => log::info!("Offline queue saved ({} record(s))", shared.queue.len()),
            Err(e) => log::error!("{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MotionConfig, TelemetryConfig};
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    struct FakeImu {
        estimator: MotionEstimator,
        fail: bool,
        reinit_calls: Arc<AtomicUsize>,
    }

    impl FakeImu {
        fn new() -> Self {
            Self {
                estimator: MotionEstimator::new(MotionConfig::default()),
                fail: false,
                reinit_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ImuSource for FakeImu {
        fn poll(&mut self, now: f64) -> TrackerResult<ImuSample> {
            if self.fail {
                return Err(TrackerError::DeviceNotFound {
                    candidates: vec![0x68, 0x69],
                });
            }
            let sample = ImuSample {
                timestamp: now,
                accel: (0.0, 0.0, 1.0),
                gyro: (0.0, 0.0, 0.0),
                temperature: 31.0,
            };
            self.estimator.update(&sample);
            Ok(sample)
        }

        fn reinitialize(&mut self) -> TrackerResult<()> {
            self.reinit_calls.fetch_add(1, Ordering::SeqCst);
            Err(TrackerError::DeviceNotFound {
                candidates: vec![0x68],
            })
        }

        fn estimator(&self) -> &MotionEstimator {
            &self.estimator
        }

        fn estimator_mut(&mut self) -> &mut MotionEstimator {
            &mut self.estimator
        }
    }

    struct FakeGps {
        fixes: VecDeque<TrackerResult<(f64, f64, f64)>>,
        polls: Arc<AtomicUsize>,
    }

    impl GpsSource for FakeGps {
        fn read_fix(&mut self, now: f64) -> TrackerResult<Option<GpsFix>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let (latitude, longitude, speed) = self
                .fixes
                .pop_front()
                .unwrap_or_else(|| Err(TrackerError::FixUnavailable("empty".into())))?;
            Ok(Some(GpsFix {
                timestamp: now,
                latitude,
                longitude,
                altitude: Some(10.0),
                speed,
                heading: Some(0.0),
                satellites: 8,
                fix: true,
                raw: String::new(),
            }))
        }

        fn reconnect(&mut self) -> TrackerResult<()> {
            Ok(())
        }

        fn close(&mut self) {}

        fn state_label(&self) -> String {
            "FIX_SEARCHING".to_string()
        }
    }

    struct StaticCamera;

    impl FrameSource for StaticCamera {
        fn capture(&mut self) -> anyhow::Result<Option<Frame>> {
            Ok(Some(Frame {
                timestamp: 0.0,
                width: 2,
                height: 2,
                jpeg: vec![0xff, 0xd8, 0xff, 0xd9],
            }))
        }
    }

    struct BrokenDetector;

    impl SignDetector for BrokenDetector {
        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
            Err(anyhow!("model not loaded"))
        }
    }

    fn offline_context(dir: &tempfile::TempDir) -> TrackerContext {
        offline_context_with(dir, |_| {})
    }

    /// Context whose connectivity probe hits a closed local port.
    fn offline_context_with(
        dir: &tempfile::TempDir,
        tweak: impl FnOnce(&mut TrackerConfig),
    ) -> TrackerContext {
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = TrackerConfig::default();
        config.telemetry = TelemetryConfig {
            connectivity_host: "127.0.0.1".into(),
            connectivity_port: closed_port,
            connectivity_timeout_ms: 200,
            offline_file: dir.path().join("offline.json").to_string_lossy().into_owned(),
            ..TelemetryConfig::default()
        };
        config.recovery.failure_threshold = 2;
        config.recovery.base_cooldown_secs = 0.0;
        tweak(&mut config);
        let queue = OfflineQueue::load(&config.telemetry.offline_file).unwrap();
        TrackerContext::new(config, queue)
    }

    fn orchestrator(ctx: &TrackerContext) -> Orchestrator {
        let sender = TelemetrySender::new(ctx.config.telemetry.clone()).unwrap();
        Orchestrator::new(ctx.clone(), sender)
    }

    fn gps_with(fixes: Vec<TrackerResult<(f64, f64, f64)>>) -> (FakeGps, Arc<AtomicUsize>) {
        let polls = Arc::new(AtomicUsize::new(0));
        (
            FakeGps {
                fixes: fixes.into(),
                polls: Arc::clone(&polls),
            },
            polls,
        )
    }

    #[test]
    fn test_sensors_polled_at_independent_rates() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context_with(&dir, |c| {
            c.schedule.imu_interval_secs = 0.25;
            c.schedule.gps_interval_secs = 1.0;
        });
        let (gps, gps_polls) = gps_with(vec![]);
        let mut orch = orchestrator(&ctx)
            .with_imu(Box::new(FakeImu::new()))
            .with_gps(Box::new(gps));

        let mut imu_polls = 0;
        for i in 0..40 {
            let report = orch.tick(1000.0 + i as f64 * 0.125);
            imu_polls += report.imu_polled as usize;
        }
        // 5s of ticks every 125ms: IMU every other tick, GPS once per second
        assert_eq!(imu_polls, 20);
        assert_eq!(gps_polls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_offline_record_is_queued_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(&dir);
        let (gps, _) = gps_with(vec![Ok((14.6, 121.1, 5.0)), Ok((14.6001, 121.1, 5.0))]);
        let mut orch = orchestrator(&ctx).with_gps(Box::new(gps));

        let report = orch.tick(1000.0);
        assert!(report.queued);
        assert!(!report.sent);

        // Inside the position interval nothing new is queued
        let report = orch.tick(1000.5);
        assert!(!report.queued);

        let reloaded = OfflineQueue::load(&ctx.config.telemetry.offline_file).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(lock_shared(&ctx.shared).usage.records_queued, 1);
    }

    #[test]
    fn test_speed_fusion_uses_both_sources() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(&dir);
        let (gps, _) = gps_with(vec![Ok((14.6, 121.1, 10.0))]);
        let mut orch = orchestrator(&ctx)
            .with_imu(Box::new(FakeImu::new()))
            .with_gps(Box::new(gps));

        let report = orch.tick(1000.0);
        // The estimator reports the fresh GPS speed, so the blend is GPS speed
        assert!((report.fused_speed - 10.0).abs() < 1e-9);
        let gps = report.record.unwrap().gps.unwrap();
        assert!(!gps.dead_reckoning);
        assert_eq!(gps.satellites, Some(8));
    }

    #[test]
    fn test_cruise_speed_held_while_gps_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context_with(&dir, |c| {
            c.schedule.imu_interval_secs = 0.125;
            c.schedule.gps_interval_secs = 2.0;
        });
        let fixes = (0..3).map(|i| Ok((14.6 + i as f64 * 0.0004, 121.1, 20.0))).collect();
        let (gps, _) = gps_with(fixes);
        let mut orch = orchestrator(&ctx)
            .with_imu(Box::new(FakeImu::new()))
            .with_gps(Box::new(gps));

        // Gravity-only IMU samples at 8 Hz for 4s: constant-velocity cruise
        let mut slowest = f64::MAX;
        for i in 0..32 {
            let report = orch.tick(1000.0 + i as f64 * 0.125);
            slowest = slowest.min(report.fused_speed);
        }
        assert!(slowest > 15.0, "fused speed dropped to {slowest}");
        assert!(!orch.imu.as_ref().unwrap().estimator().is_stationary());
    }

    #[test]
    fn test_gps_queries_respect_fix_check_interval() {
        use crate::config::GpsConfig;
        use crate::gps::testing::ScriptedModem;

        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context_with(&dir, |c| {
            c.schedule.gps_interval_secs = 0.125;
        });
        let modem = ScriptedModem::new().respond(
            "AT+CGNSSINFO",
            "+CGNSSINFO: 3,17,,09,10,14.6198673,N,121.1038513,E,120525,112149.00,78.0,0.000,15.78,1.91,0.95,1.6\r\nOK\r\n",
        );
        let config = GpsConfig {
            command_timeout_ms: 40,
            fix_check_interval_secs: 1.0,
            ..GpsConfig::default()
        };
        let handle = modem.clone();
        let mut session = GpsSession::new(config, Box::new(move || Ok(handle.clone())));
        session.open().unwrap();
        let mut orch = orchestrator(&ctx).with_gps(Box::new(session));

        let queries = || {
            modem
                .commands()
                .iter()
                .filter(|c| *c == "AT+CGNSSINFO")
                .count()
        };
        for i in 0..8 {
            let report = orch.tick(1000.0 + i as f64 * 0.125);
            assert!(report.gps_polled);
        }
        assert_eq!(queries(), 1);
        assert_eq!(orch.restarts().gps.consecutive_failures, 0);
        assert!(lock_shared(&ctx.shared).status.gps_fix);

        orch.tick(1001.0);
        assert_eq!(queries(), 2);
    }

    #[test]
    fn test_dead_reckoning_fallback_then_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(&dir);
        let (gps, _) = gps_with(vec![Ok((14.6, 121.1, 0.0))]);
        let mut orch = orchestrator(&ctx)
            .with_imu(Box::new(FakeImu::new()))
            .with_gps(Box::new(gps));

        orch.tick(1000.0);
        // GPS goes quiet; once the fix is stale the IMU fills in
        let report = orch.tick(1010.0);
        let gps = report.record.unwrap().gps.unwrap();
        assert!(gps.dead_reckoning);
        assert!((gps.latitude - 14.6).abs() < 1e-9);

        let report = orch.tick(1010.0 + 299.0);
        assert!(report.record.unwrap().gps.is_some());

        let report = orch.tick(1010.0 + 301.0);
        assert!(report.record.unwrap().gps.is_none());
    }

    #[test]
    fn test_detector_failure_means_no_detections() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(&dir);
        let mut orch =
            orchestrator(&ctx).with_camera(Box::new(StaticCamera), Box::new(BrokenDetector));

        let report = orch.tick(1000.0);
        assert!(report.camera_polled);
        let record = report.record.unwrap();
        assert!(record.detections.is_empty());
        assert!(record.image.is_none());
    }

    #[test]
    fn test_consecutive_imu_failures_trigger_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(&dir);
        let mut imu = FakeImu::new();
        imu.fail = true;
        let reinit_calls = Arc::clone(&imu.reinit_calls);
        let mut orch = orchestrator(&ctx).with_imu(Box::new(imu));

        orch.tick(1000.0);
        assert_eq!(reinit_calls.load(Ordering::SeqCst), 0);
        orch.tick(1000.1);
        assert_eq!(reinit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.restarts().imu.attempts, 1);
        assert!(!lock_shared(&ctx.shared).status.imu.healthy);
    }

    #[test]
    fn test_status_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(&dir);
        let (gps, _) = gps_with(vec![Ok((14.6, 121.1, 3.0))]);
        let mut orch = orchestrator(&ctx).with_gps(Box::new(gps));

        orch.tick(1000.0);
        let snapshot = lock_shared(&ctx.shared).snapshot();
        assert_eq!(snapshot.status.latitude, Some(14.6));
        assert!(snapshot.status.gps_fix);
        assert_eq!(snapshot.queue_depth, 1);
        assert_eq!(snapshot.status.ticks, 1);
    }

    #[test]
    fn test_backlog_flushed_when_online() {
        use std::io::{BufRead, BufReader, Read as _, Write as _};

        let dir = tempfile::tempdir().unwrap();
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let backend = TcpListener::bind("127.0.0.1:0").unwrap();
        let backend_url = format!("http://{}", backend.local_addr().unwrap());
        let server = thread::spawn(move || {
            for _ in 0..2 {
                let (stream, _) = backend.accept().unwrap();
                let mut reader = BufReader::new(stream);
                let mut length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    let line = line.trim_end().to_ascii_lowercase();
                    if line.is_empty() {
                        break;
                    }
                    if let Some(v) = line.strip_prefix("content-length:") {
                        length = v.trim().parse().unwrap();
                    }
                }
                let mut body = vec![0u8; length];
                reader.read_exact(&mut body).unwrap();
                let mut stream = reader.into_inner();
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .unwrap();
            }
        });

        let mut config = TrackerConfig::default();
        config.telemetry = TelemetryConfig {
            backend_url,
            connectivity_host: "127.0.0.1".into(),
            connectivity_port: probe.local_addr().unwrap().port(),
            offline_file: dir.path().join("offline.json").to_string_lossy().into_owned(),
            retry_backoff_ms: 0,
            ..TelemetryConfig::default()
        };
        let mut queue = OfflineQueue::load(&config.telemetry.offline_file).unwrap();
        for lat in [1.0, 2.0] {
            let mut record = TelemetryRecord::new(Utc::now());
            record.gps = Some(GpsSnapshot {
                latitude: lat,
                longitude: 0.0,
                speed: 0.0,
                altitude: None,
                satellites: None,
                heading: None,
                dead_reckoning: false,
                accuracy: crate::telemetry::Accuracy::High,
            });
            queue.push(record).unwrap();
        }
        let ctx = TrackerContext::new(config, queue);
        let mut orch = orchestrator(&ctx);

        let report = orch.tick(1000.0);
        assert_eq!(report.flushed, 2);
        server.join().unwrap();

        let shared = lock_shared(&ctx.shared);
        assert!(shared.queue.is_empty());
        assert_eq!(shared.usage.records_flushed, 2);
        assert_eq!(shared.usage.payloads_sent, 2);
        drop(probe);
    }

    #[test]
    fn test_shutdown_flag_stops_run() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(&dir);
        let mut orch = orchestrator(&ctx);
        ctx.request_shutdown();
        orch.run(None);
        assert!(std::path::Path::new(&ctx.config.telemetry.offline_file).exists());
    }
}
