//! Reporting of unrecoverable faults (panics) to a tracking backend.

use std::any::Any;
use std::time::Duration;

use tracing::error;

/// How long a reporter may take to flush pending fault reports
pub const FAULT_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

/// Sink for unrecoverable faults
pub trait FaultReporter: Send + Sync {
    /// Record a fault
    fn capture(&self, message: &str);

    /// Deliver pending reports, waiting at most `deadline`.
    /// Returns false if reports were still pending when the deadline passed.
    fn flush(&self, deadline: Duration) -> bool;
}

/// Reporter that writes faults to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFaultReporter;

impl FaultReporter for LogFaultReporter {
    fn capture(&self, message: &str) {
        error!(fault = %message, "Unrecoverable fault");
    }

    fn flush(&self, _deadline: Duration) -> bool {
        true
    }
}

/// Extract a readable message from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_str() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }

    #[test]
    fn test_panic_message_string() {
        let payload: Box<dyn Any + Send> = Box::new(format!("boom {}", 2));
        assert_eq!(panic_message(payload.as_ref()), "boom 2");
    }

    #[test]
    fn test_panic_message_unknown() {
        let payload: Box<dyn Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_log_reporter_flushes() {
        let reporter = LogFaultReporter;
        reporter.capture("test fault");
        assert!(reporter.flush(FAULT_FLUSH_DEADLINE));
    }
}
