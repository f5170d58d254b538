pub mod log;
pub mod severity;
pub mod time;

pub use log::{log, set_severity_floor};
pub use severity::LogSeverity;
