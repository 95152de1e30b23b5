pub mod config;
pub mod error;
pub mod filters;
pub mod fusion;
pub mod gps;
pub mod imu;
pub mod live_status;
pub mod orchestrator;
pub mod restart_manager;
pub mod status_server;
pub mod telemetry;
pub mod types;
pub mod usage;

pub use config::TrackerConfig;
pub use error::{TrackerError, TrackerResult};
pub use orchestrator::{Orchestrator, TrackerContext};
