pub mod at;
pub mod parser;
pub mod session;

pub use parser::{parse_fix_response, FieldLayout};
pub use session::{GpsSession, GpsState};
