// Motion error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Motion error code constants
///
/// Error code range: 1001-1005
pub struct MotionErrorCodes {}

impl MotionErrorCodes {
    /// Motor did not report settled at the commanded position
    pub const NOT_SETTLED: i32 = 1001;

    /// Motor did not settle before the settle timeout expired
    pub const TIMEOUT: i32 = 1002;

    /// Commanded position lies outside the motor's soft limits
    pub const LIMIT_EXCEEDED: i32 = 1003;

    /// Motor reported a hardware fault
    pub const FAULT: i32 = 1004;

    /// Measurement probe failed to produce a centroid
    pub const PROBE: i32 = 1005;
}

/// Log a motion error with structured context
///
/// The logging is non-blocking and will not panic on failure.
pub fn log_motion_error(err: &MotionError, context: &str) {
    error!(
        "Motion error in {}: code={}, component=Motion, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Errors reported by the motor and probe collaborators
///
/// These errors come from a single move or measurement. The calibration
/// layer wraps them together with the stage in which they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionError {
    /// Motor stopped short of the commanded position
    NotSettled {
        motor: String,
        target: f64,
        position: f64,
    },

    /// Motor did not settle before the timeout expired
    Timeout { motor: String, target: f64 },

    /// Commanded position lies outside the soft limits
    LimitExceeded {
        motor: String,
        target: f64,
        low: f64,
        high: f64,
    },

    /// Motor reported a hardware fault
    Fault { motor: String, details: String },

    /// Probe failed to deliver a centroid
    Probe { details: String },
}

impl MotionError {
    /// Whether a fresh attempt at the same move may succeed
    ///
    /// Settling failures are transient; limit violations, faults and probe
    /// failures are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MotionError::NotSettled { .. } | MotionError::Timeout { .. }
        )
    }
}

impl ErrorCode for MotionError {
    fn code(&self) -> i32 {
        match self {
            MotionError::NotSettled { .. } => MotionErrorCodes::NOT_SETTLED,
            MotionError::Timeout { .. } => MotionErrorCodes::TIMEOUT,
            MotionError::LimitExceeded { .. } => MotionErrorCodes::LIMIT_EXCEEDED,
            MotionError::Fault { .. } => MotionErrorCodes::FAULT,
            MotionError::Probe { .. } => MotionErrorCodes::PROBE,
        }
    }

    fn message(&self) -> String {
        match self {
            MotionError::NotSettled {
                motor,
                target,
                position,
            } => format!(
                "Motor '{}' did not settle at {} (stopped at {})",
                motor, target, position
            ),
            MotionError::Timeout { motor, target } => {
                format!("Motor '{}' timed out moving to {}", motor, target)
            }
            MotionError::LimitExceeded {
                motor,
                target,
                low,
                high,
            } => format!(
                "Motor '{}' target {} outside limits [{}, {}]",
                motor, target, low, high
            ),
            MotionError::Fault { motor, details } => {
                format!("Motor '{}' faulted: {}", motor, details)
            }
            MotionError::Probe { details } => format!("Probe failed: {}", details),
        }
    }
}

impl fmt::Display for MotionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MotionError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for MotionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_error_codes() {
        assert_eq!(
            MotionError::NotSettled {
                motor: "m".to_string(),
                target: 1.0,
                position: 0.5
            }
            .code(),
            1001
        );
        assert_eq!(
            MotionError::Timeout {
                motor: "m".to_string(),
                target: 1.0
            }
            .code(),
            1002
        );
        assert_eq!(
            MotionError::LimitExceeded {
                motor: "m".to_string(),
                target: 9.0,
                low: -1.0,
                high: 1.0
            }
            .code(),
            1003
        );
        assert_eq!(
            MotionError::Fault {
                motor: "m".to_string(),
                details: "amp".to_string()
            }
            .code(),
            1004
        );
        assert_eq!(
            MotionError::Probe {
                details: "no beam".to_string()
            }
            .code(),
            1005
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(MotionError::Timeout {
            motor: "m".to_string(),
            target: 0.0
        }
        .is_retryable());
        assert!(!MotionError::Fault {
            motor: "m".to_string(),
            details: "x".to_string()
        }
        .is_retryable());
        assert!(!MotionError::Probe {
            details: "x".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_motion_error_display() {
        let err = MotionError::LimitExceeded {
            motor: "tilt".to_string(),
            target: 5.0,
            low: -1.0,
            high: 1.0,
        };
        let display = format!("{}", err);
        assert!(display.contains("MotionError"));
        assert!(display.contains("1003"));
        assert!(err.message().contains("tilt"));
    }
}
