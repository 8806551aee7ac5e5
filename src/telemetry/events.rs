//! Calibration event types published by the drift engine.

use serde::{Deserialize, Serialize};

use crate::error::CalibrationStage;

/// Progress and diagnostics emitted while calibrating and moving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CalibrationEvent {
    ScanStep {
        index: usize,
        total: usize,
        target: f64,
        measured_x: f64,
        measured_y: f64,
    },
    WalkStep {
        corrector: String,
        displacement: f64,
        pixel: f64,
    },
    ScaleFitted {
        corrector: String,
        slope: f64,
        scale: f64,
        r_squared: f64,
    },
    Restored {
        motor: String,
        position: f64,
    },
    RestoreFailed {
        motor: String,
        position: f64,
        reason: String,
    },
    Extrapolated {
        target: f64,
        low: f64,
        high: f64,
    },
    Saved {
        path: String,
    },
    Loaded {
        path: String,
    },
    Failed {
        stage: Option<CalibrationStage>,
        code: i32,
        message: String,
    },
}
