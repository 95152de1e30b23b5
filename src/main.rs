use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use linux_embedded_hal::I2cdev;

use vehicle_tracker_rs::config::TrackerConfig;
use vehicle_tracker_rs::error::{TrackerError, TrackerResult};
use vehicle_tracker_rs::gps::GpsSession;
use vehicle_tracker_rs::imu::Imu;
use vehicle_tracker_rs::orchestrator::{Orchestrator, TrackerContext};
use vehicle_tracker_rs::telemetry::{OfflineQueue, TelemetrySender};
use vehicle_tracker_rs::{status_server, usage};

#[derive(Parser, Debug)]
#[command(name = "vehicle_tracker")]
#[command(about = "Vehicle tracker edge agent - IMU/GPS fusion with offline-tolerant telemetry", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Log level (overrides the config file; RUST_LOG overrides both)
    #[arg(long)]
    log_level: Option<String>,

    /// Duration in seconds (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Skip the stationary IMU calibration at startup
    #[arg(long)]
    skip_calibration: bool,
}

/// Retry `open` within the startup budget.
fn with_startup_retries<T>(
    what: &str,
    config: &TrackerConfig,
    mut open: impl FnMut() -> TrackerResult<T>,
) -> TrackerResult<T> {
    let attempts = config.startup.max_retries.max(1);
    let delay = Duration::from_secs(config.startup.retry_delay_secs);
    let mut attempt = 1;
    loop {
        match open() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                log::warn!("{} startup attempt {}/{} failed: {}", what, attempt, attempts, e);
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn open_imu(config: &TrackerConfig, skip_calibration: bool) -> Result<Imu<I2cdev>> {
    let bus_path = format!("/dev/i2c-{}", config.imu.i2c_bus);
    let bus = with_startup_retries("I2C bus", config, || {
        I2cdev::new(&bus_path).map_err(|e| TrackerError::TransportOpen {
            transport: bus_path.clone(),
            reason: e.to_string(),
        })
    })
    .with_context(|| format!("Failed to open IMU bus {}", bus_path))?;

    let mut imu = Imu::new(bus, &config.imu);
    match with_startup_retries("IMU", config, || imu.initialize()) {
        Ok(address) => {
            log::info!("IMU ready at 0x{:02x}", address);
            if skip_calibration {
                log::info!("Skipping IMU calibration");
            } else if let Err(e) = imu.calibrate() {
                log::warn!("IMU calibration failed, using defaults: {}", e);
            }
        }
        Err(e) => log::error!("IMU unavailable, will retry from the main loop: {}", e),
    }
    Ok(imu)
}

fn open_gps(config: &TrackerConfig) -> Result<GpsSession<Box<dyn serialport::SerialPort>>> {
    let port = config.gps.port.clone();
    let baudrate = config.gps.baudrate;
    let timeout = Duration::from_millis(config.gps.read_timeout_ms);
    let opener = Box::new(move || {
        serialport::new(&port, baudrate)
            .timeout(timeout)
            .open()
            .map_err(|e| TrackerError::TransportOpen {
                transport: port.clone(),
                reason: e.to_string(),
            })
    });

    let mut session = GpsSession::new(config.gps.clone(), opener);
    match with_startup_retries("GPS", config, || session.connect()) {
        Ok(()) => {}
        Err(e) if e.is_fatal() => {
            return Err(e).with_context(|| format!("Failed to open GPS port {}", config.gps.port))
        }
        Err(e) => log::error!("GPS not ready, will retry from the main loop: {}", e),
    }
    Ok(session)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = TrackerConfig::load(&args.config)?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    log::info!("Vehicle tracker starting");
    if args.config.exists() {
        log::info!("Configuration loaded from {}", args.config.display());
    } else {
        log::warn!(
            "Config file {} not found, using defaults",
            args.config.display()
        );
    }

    let queue = match OfflineQueue::load(&config.telemetry.offline_file) {
        Ok(queue) => queue,
        Err(e) => {
            log::error!("{}; starting with an empty queue", e);
            OfflineQueue::empty(&config.telemetry.offline_file)
        }
    };

    let imu = open_imu(&config, args.skip_calibration)?;
    let gps = open_gps(&config)?;
    log::info!("No camera collaborator configured, sign detection disabled");

    let ctx = TrackerContext::new(config, queue);
    let status = status_server::spawn(&ctx.config.status, ctx.shared.clone(), ctx.shutdown.clone())?;
    let usage = usage::spawn(&ctx.config.usage, &ctx.config.telemetry, ctx.shared.clone())?;

    let sender = TelemetrySender::new(ctx.config.telemetry.clone())?;
    let mut orchestrator = Orchestrator::new(ctx.clone(), sender)
        .with_imu(Box::new(imu))
        .with_gps(Box::new(gps));

    let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    orchestrator.run(duration);

    ctx.request_shutdown();
    usage.stop();
    status.join();
    log::info!("Vehicle tracker stopped");
    Ok(())
}
