// DriftScanner - centroid drift along the logical axis
//
// Drives the logical axis through start..=stop by `step`, sampling the probe
// at every stop. The axis is left at the last target; putting it back is the
// caller's job.

use crate::calibration::{ScanRecord, ScanSample};
use crate::config::{MotionConfig, ScanConfig};
use crate::error::{CalibrationError, CalibrationStage, MotionError};
use crate::hardware::{measure_average, move_settled, CancelToken, LogicalAxis, MeasurementProbe};
use crate::telemetry::{self, CalibrationEvent};

/// Relative slack when deciding whether `stop` lands on a whole step
const STEP_EPSILON: f64 = 1e-9;

/// Targets visited by a scan from `start` to `stop` inclusive
///
/// Targets advance by `step` from `start`; the last target is always `stop`
/// itself, so a span that is not a whole number of steps ends with a shorter
/// final step.
///
/// # Errors
/// `InvalidRange` when any bound is not finite, `step` is zero, the sign of
/// `step` disagrees with `stop - start`, or the scan would exceed `max_points`.
pub fn scan_targets(
    start: f64,
    stop: f64,
    step: f64,
    max_points: usize,
) -> Result<Vec<f64>, CalibrationError> {
    let invalid = |reason: &str| CalibrationError::InvalidRange {
        start,
        stop,
        step,
        reason: reason.to_string(),
    };

    if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
        return Err(invalid("bounds must be finite"));
    }
    if step == 0.0 {
        return Err(invalid("step must be non-zero"));
    }
    let span = stop - start;
    if span != 0.0 && span.signum() != step.signum() {
        return Err(invalid("step direction does not match stop - start"));
    }

    // A non-empty span always visits both endpoints
    let steps = if span == 0.0 {
        0.0
    } else {
        (span / step - STEP_EPSILON).ceil().max(1.0)
    };
    if steps + 1.0 > max_points as f64 {
        return Err(invalid(&format!(
            "scan needs {} points, limit is {}",
            steps + 1.0,
            max_points
        )));
    }

    let steps = steps as usize;
    let mut targets: Vec<f64> = (0..steps).map(|i| start + i as f64 * step).collect();
    targets.push(stop);
    Ok(targets)
}

/// Sweeps the logical axis and records the centroid at every stop
pub struct DriftScanner<'a> {
    motion: &'a MotionConfig,
    scan: &'a ScanConfig,
    cancel: &'a CancelToken,
}

impl<'a> DriftScanner<'a> {
    pub fn new(motion: &'a MotionConfig, scan: &'a ScanConfig, cancel: &'a CancelToken) -> Self {
        Self {
            motion,
            scan,
            cancel,
        }
    }

    /// Run the scan
    ///
    /// # Errors
    /// - `InvalidRange` for malformed bounds (no motion happens)
    /// - `ScanAborted` when a move or measurement fails, carrying the samples
    ///   taken so far
    /// - `Cancelled` when the cancel token fires between stops
    pub fn scan<A, P>(
        &self,
        axis: &mut A,
        probe: &mut P,
        start: f64,
        stop: f64,
        step: f64,
    ) -> Result<ScanRecord, CalibrationError>
    where
        A: LogicalAxis + ?Sized,
        P: MeasurementProbe + ?Sized,
    {
        let targets = scan_targets(start, stop, step, self.scan.max_points)?;
        let total = targets.len();
        log::info!(
            "[Scan] {} from {} to {} step {} ({} points)",
            axis.name(),
            start,
            stop,
            step,
            total
        );

        let mut record = ScanRecord::new();
        for (index, &target) in targets.iter().enumerate() {
            self.cancel.check(CalibrationStage::Scan)?;

            let measured = move_settled(axis, target, self.motion)
                .and_then(|_| measure_average(probe, self.scan.average));
            let centroid = match measured {
                Ok(centroid) => centroid,
                Err(source) => return Err(abort(record, source)),
            };

            log::debug!(
                "[Scan] step {}/{} target={} x={} y={}",
                index + 1,
                total,
                target,
                centroid.x,
                centroid.y
            );
            telemetry::hub().publish(CalibrationEvent::ScanStep {
                index,
                total,
                target,
                measured_x: centroid.x,
                measured_y: centroid.y,
            });
            record.push(ScanSample::new(target, centroid.x, centroid.y));
        }

        log::info!("[Scan] completed with {} samples", record.len());
        Ok(record)
    }
}

fn abort(partial: ScanRecord, source: MotionError) -> CalibrationError {
    log::error!(
        "[Scan] aborted after {} samples: {}",
        partial.len(),
        source
    );
    CalibrationError::ScanAborted {
        stage: CalibrationStage::Scan,
        partial,
        source,
    }
}
