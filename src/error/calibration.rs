// Calibration error types and constants

use crate::calibration::{Calibration, ScanRecord};
use crate::error::{ErrorCode, MotionError};
use log::error;
use std::fmt;
use std::path::PathBuf;

/// Calibration error code constants
///
/// These constants provide a single source of truth for error codes
/// reported by the calibration engine and the command-line tool.
///
/// Error code range: 2001-2017
pub struct CalibrationErrorCodes {}

impl CalibrationErrorCodes {
    /// Malformed scan bounds
    pub const INVALID_RANGE: i32 = 2001;

    /// Motion or measurement failure in the middle of a drift scan
    pub const SCAN_ABORTED: i32 = 2002;

    /// Corrector walk produced no usable slope
    pub const DEGENERATE_FIT: i32 = 2003;

    /// Calibration would overwrite a loaded one without confirmation
    pub const CALIBRATION_EXISTS: i32 = 2004;

    /// Requested calibration file does not exist
    pub const NOT_FOUND: i32 = 2005;

    /// Calibration file is malformed or structurally invalid
    pub const FORMAT: i32 = 2006;

    /// Requested change would break the calibration's structural invariants
    pub const INVARIANT_VIOLATION: i32 = 2007;

    /// Routine interrupted by the user
    pub const CANCELLED: i32 = 2008;

    /// Motor or probe failure outside of the drift scan
    pub const MOTION: i32 = 2009;

    /// Named corrector is not attached to the axis
    pub const UNKNOWN_CORRECTOR: i32 = 2010;

    /// Operation requires a loaded calibration
    pub const NO_CALIBRATION: i32 = 2011;

    /// Another routine holds the hardware
    pub const ALREADY_IN_PROGRESS: i32 = 2012;

    /// Calibration state lock was poisoned
    pub const STATE_POISONED: i32 = 2013;

    /// Filesystem failure while reading or writing a calibration
    pub const IO: i32 = 2014;

    /// Operation requires a completed drift scan
    pub const NO_SCAN: i32 = 2015;

    /// Corrector readback did not change across its walk
    pub const FLAT_SWEEP: i32 = 2016;

    /// Routine finished but the rig could not be put back
    pub const UNRESTORED: i32 = 2017;
}

/// Stage of a calibration routine, reported with motion failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStage {
    /// Capturing the corrector reference positions
    Capture,
    /// Sweeping the logical axis and sampling the probe
    Scan,
    /// Walking a corrector to fit its sensitivity
    Walk,
    /// Building the correction table
    Table,
    /// Returning motors to their starting positions
    Restore,
    /// Applying corrections during a move
    Apply,
}

impl CalibrationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationStage::Capture => "capture",
            CalibrationStage::Scan => "scan",
            CalibrationStage::Walk => "walk",
            CalibrationStage::Table => "table",
            CalibrationStage::Restore => "restore",
            CalibrationStage::Apply => "apply",
        }
    }
}

impl fmt::Display for CalibrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log a calibration error with structured context
///
/// This function logs calibration errors with structured fields including:
/// - error_code: Numeric error code for programmatic handling
/// - component: The component where the error occurred
/// - message: Human-readable error message
/// - context: Additional contextual information
///
/// The logging is non-blocking and will not panic on failure.
pub fn log_calibration_error(err: &CalibrationError, context: &str) {
    error!(
        "Calibration error in {}: code={}, component=CalibrationEngine, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Calibration-related errors
///
/// These errors cover drift scanning, corrector walks, table construction,
/// persistence and reconfiguration.
///
/// Error code range: 2001-2017
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// Scan bounds are malformed
    InvalidRange {
        start: f64,
        stop: f64,
        step: f64,
        reason: String,
    },

    /// Drift scan stopped early; carries the samples taken so far
    ScanAborted {
        stage: CalibrationStage,
        partial: ScanRecord,
        source: MotionError,
    },

    /// Corrector walk had no detectable effect on the centroid
    DegenerateFit {
        corrector: String,
        slope: f64,
        threshold: f64,
    },

    /// A valid calibration is loaded and no overwrite confirmation was given
    CalibrationExists,

    /// No calibration stored at the resolved path
    CalibrationNotFound { path: PathBuf },

    /// Stored calibration is malformed or breaks structural invariants
    CalibrationFormat { path: PathBuf, reason: String },

    /// Change would break the structural invariants of a calibration
    InvariantViolation { reason: String },

    /// Routine interrupted by the user
    Cancelled { stage: CalibrationStage },

    /// Motor or probe failure outside of the drift scan
    Motion {
        stage: CalibrationStage,
        source: MotionError,
    },

    /// Corrector name is not attached to the axis
    UnknownCorrector { name: String },

    /// No calibration is loaded
    NoCalibration,

    /// Another routine holds exclusive access to the hardware
    AlreadyInProgress,

    /// Calibration state RwLock was poisoned
    StatePoisoned,

    /// Filesystem failure
    Io { path: PathBuf, details: String },

    /// No drift scan has been recorded yet
    NoScan,

    /// Walk readbacks never moved, so no slope can be fitted
    FlatSweep { corrector: String, readback: f64 },

    /// The calibration was built but restoring the rig failed afterwards
    Unrestored {
        calibration: Box<Calibration>,
        source: MotionError,
    },
}

impl CalibrationError {
    /// Wrap a motion failure with the stage in which it happened
    pub fn motion(stage: CalibrationStage, source: MotionError) -> Self {
        CalibrationError::Motion { stage, source }
    }

    /// Build an invariant violation from any displayable reason
    pub fn invariant(reason: impl Into<String>) -> Self {
        CalibrationError::InvariantViolation {
            reason: reason.into(),
        }
    }

    /// Stage reported by stage-tagged variants
    pub fn stage(&self) -> Option<CalibrationStage> {
        match self {
            CalibrationError::ScanAborted { stage, .. }
            | CalibrationError::Cancelled { stage }
            | CalibrationError::Motion { stage, .. } => Some(*stage),
            CalibrationError::Unrestored { .. } => Some(CalibrationStage::Restore),
            _ => None,
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            CalibrationError::InvalidRange { .. } => "InvalidRange",
            CalibrationError::ScanAborted { .. } => "ScanAborted",
            CalibrationError::DegenerateFit { .. } => "DegenerateFit",
            CalibrationError::CalibrationExists => "CalibrationExists",
            CalibrationError::CalibrationNotFound { .. } => "CalibrationNotFound",
            CalibrationError::CalibrationFormat { .. } => "CalibrationFormat",
            CalibrationError::InvariantViolation { .. } => "InvariantViolation",
            CalibrationError::Cancelled { .. } => "Cancelled",
            CalibrationError::Motion { .. } => "Motion",
            CalibrationError::UnknownCorrector { .. } => "UnknownCorrector",
            CalibrationError::NoCalibration => "NoCalibration",
            CalibrationError::AlreadyInProgress => "AlreadyInProgress",
            CalibrationError::StatePoisoned => "StatePoisoned",
            CalibrationError::Io { .. } => "Io",
            CalibrationError::NoScan => "NoScan",
            CalibrationError::FlatSweep { .. } => "FlatSweep",
            CalibrationError::Unrestored { .. } => "Unrestored",
        }
    }
}

impl ErrorCode for CalibrationError {
    fn code(&self) -> i32 {
        match self {
            CalibrationError::InvalidRange { .. } => CalibrationErrorCodes::INVALID_RANGE,
            CalibrationError::ScanAborted { .. } => CalibrationErrorCodes::SCAN_ABORTED,
            CalibrationError::DegenerateFit { .. } => CalibrationErrorCodes::DEGENERATE_FIT,
            CalibrationError::CalibrationExists => CalibrationErrorCodes::CALIBRATION_EXISTS,
            CalibrationError::CalibrationNotFound { .. } => CalibrationErrorCodes::NOT_FOUND,
            CalibrationError::CalibrationFormat { .. } => CalibrationErrorCodes::FORMAT,
            CalibrationError::InvariantViolation { .. } => {
                CalibrationErrorCodes::INVARIANT_VIOLATION
            }
            CalibrationError::Cancelled { .. } => CalibrationErrorCodes::CANCELLED,
            CalibrationError::Motion { .. } => CalibrationErrorCodes::MOTION,
            CalibrationError::UnknownCorrector { .. } => CalibrationErrorCodes::UNKNOWN_CORRECTOR,
            CalibrationError::NoCalibration => CalibrationErrorCodes::NO_CALIBRATION,
            CalibrationError::AlreadyInProgress => CalibrationErrorCodes::ALREADY_IN_PROGRESS,
            CalibrationError::StatePoisoned => CalibrationErrorCodes::STATE_POISONED,
            CalibrationError::Io { .. } => CalibrationErrorCodes::IO,
            CalibrationError::NoScan => CalibrationErrorCodes::NO_SCAN,
            CalibrationError::FlatSweep { .. } => CalibrationErrorCodes::FLAT_SWEEP,
            CalibrationError::Unrestored { .. } => CalibrationErrorCodes::UNRESTORED,
        }
    }

    fn message(&self) -> String {
        match self {
            CalibrationError::InvalidRange {
                start,
                stop,
                step,
                reason,
            } => format!(
                "Invalid scan range start={} stop={} step={}: {}",
                start, stop, step, reason
            ),
            CalibrationError::ScanAborted {
                stage,
                partial,
                source,
            } => format!(
                "Scan aborted during {} after {} samples: {}",
                stage,
                partial.len(),
                source.message()
            ),
            CalibrationError::DegenerateFit {
                corrector,
                slope,
                threshold,
            } => format!(
                "Walk of '{}' produced slope {:e}, below sensitivity {:e}",
                corrector, slope, threshold
            ),
            CalibrationError::CalibrationExists => {
                "A calibration is already loaded; confirm the overwrite to recalibrate"
                    .to_string()
            }
            CalibrationError::CalibrationNotFound { path } => {
                format!("No calibration found at {}", path.display())
            }
            CalibrationError::CalibrationFormat { path, reason } => {
                format!("Malformed calibration {}: {}", path.display(), reason)
            }
            CalibrationError::InvariantViolation { reason } => {
                format!("Calibration invariant violated: {}", reason)
            }
            CalibrationError::Cancelled { stage } => {
                format!("Calibration cancelled during {}", stage)
            }
            CalibrationError::Motion { stage, source } => {
                format!("Motion failed during {}: {}", stage, source.message())
            }
            CalibrationError::UnknownCorrector { name } => {
                format!("Corrector '{}' is not attached to the axis", name)
            }
            CalibrationError::NoCalibration => "No calibration loaded".to_string(),
            CalibrationError::AlreadyInProgress => {
                "Another calibration routine holds the hardware".to_string()
            }
            CalibrationError::StatePoisoned => "Calibration state lock poisoned".to_string(),
            CalibrationError::Io { path, details } => {
                format!("I/O error on {}: {}", path.display(), details)
            }
            CalibrationError::NoScan => "No drift scan recorded".to_string(),
            CalibrationError::FlatSweep {
                corrector,
                readback,
            } => format!(
                "Walk of '{}' never left readback {}; check that the corrector moves",
                corrector, readback
            ),
            CalibrationError::Unrestored {
                calibration,
                source,
            } => format!(
                "Calibration of {:?} completed but restore failed: {}",
                calibration.correctors(),
                source.message()
            ),
        }
    }
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CalibrationError::{} (code {}): {}",
            self.variant_name(),
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for CalibrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CalibrationError::ScanAborted { source, .. }
            | CalibrationError::Motion { source, .. }
            | CalibrationError::Unrestored { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn fault() -> MotionError {
        MotionError::Fault {
            motor: "delay".to_string(),
            details: "amplifier".to_string(),
        }
    }

    #[test]
    fn test_calibration_error_codes() {
        assert_eq!(
            CalibrationError::InvalidRange {
                start: 0.0,
                stop: 1.0,
                step: 0.0,
                reason: "zero step".to_string()
            }
            .code(),
            CalibrationErrorCodes::INVALID_RANGE
        );
        assert_eq!(
            CalibrationError::ScanAborted {
                stage: CalibrationStage::Scan,
                partial: ScanRecord::new(),
                source: fault()
            }
            .code(),
            CalibrationErrorCodes::SCAN_ABORTED
        );
        assert_eq!(
            CalibrationError::CalibrationExists.code(),
            CalibrationErrorCodes::CALIBRATION_EXISTS
        );
        assert_eq!(
            CalibrationError::invariant("x").code(),
            CalibrationErrorCodes::INVARIANT_VIOLATION
        );
        assert_eq!(
            CalibrationError::StatePoisoned.code(),
            CalibrationErrorCodes::STATE_POISONED
        );
        assert_eq!(CalibrationError::NoScan.code(), 2015);
        assert_eq!(
            CalibrationError::FlatSweep {
                corrector: "tilt".to_string(),
                readback: 0.0
            }
            .code(),
            CalibrationErrorCodes::FLAT_SWEEP
        );
    }

    #[test]
    fn test_stage_is_reported() {
        let err = CalibrationError::motion(CalibrationStage::Walk, fault());
        assert_eq!(err.stage(), Some(CalibrationStage::Walk));
        assert!(err.message().contains("walk"));
        assert_eq!(CalibrationError::NoCalibration.stage(), None);
    }

    #[test]
    fn test_source_chain_exposes_motion_error() {
        let err = CalibrationError::motion(CalibrationStage::Restore, fault());
        let source = err.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(source.contains("amplifier"));
    }

    #[test]
    fn test_calibration_error_display() {
        let err = CalibrationError::ScanAborted {
            stage: CalibrationStage::Scan,
            partial: ScanRecord::new(),
            source: fault(),
        };
        let display = format!("{}", err);
        assert!(display.contains("CalibrationError::ScanAborted"));
        assert!(display.contains("2002"));
        assert!(display.contains("after 0 samples"));
    }
}
