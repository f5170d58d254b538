use crate::severity::LogSeverity;
use crate::time::now;
use once_cell::sync::OnceCell;

static SEVERITY_FLOOR: OnceCell<LogSeverity> = OnceCell::new();

/// Sets the process-wide minimum severity. May be called once; later calls
/// are ignored so library consumers cannot override the host's choice.
pub fn set_severity_floor(floor: LogSeverity) {
    let _ = SEVERITY_FLOOR.set(floor);
}

fn floor() -> LogSeverity {
    SEVERITY_FLOOR.get().copied().unwrap_or(LogSeverity::Info)
}

pub fn log(msg: String, log_severity: LogSeverity) {
    if log_severity < floor() {
        return;
    }
    println!("[{}] {} {}", log_severity, now(), msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_floor_is_info() {
        // The floor must default sanely before any host initialization.
        assert!(floor() >= LogSeverity::Debug);
    }
}
