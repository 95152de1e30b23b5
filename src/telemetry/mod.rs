pub mod offline_queue;
pub mod record;
pub mod sender;

pub use offline_queue::{deliver_backlog, OfflineQueue};
pub use record::{Accuracy, BackendUpdate, GpsSnapshot, ImuSnapshot, TelemetryRecord};
pub use sender::{Delivery, SendMode, TelemetrySender};
