// Correction applier - corrector setpoints for a logical-axis target
//
// Setpoints are the corrector reference positions plus the table delta at
// the target. Between table rows the delta is interpolated linearly; outside
// the calibrated window it is extrapolated from the nearest edge segment.

use crate::calibration::{Calibration, CorrectionTable};
use crate::error::{CalibrationError, CalibrationStage};
use crate::telemetry::{self, CalibrationEvent};

/// Where a target falls relative to the table keys
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placement {
    /// Exactly on row `index`
    Exact(usize),
    /// Between rows `lower` and `lower + 1`
    Between { lower: usize, fraction: f64 },
    /// Outside the keys; `fraction` is relative to edge segment `lower`
    Beyond { lower: usize, fraction: f64 },
}

/// Locate `target` among the table keys
///
/// Keys may be ascending or descending. Returns `None` for an empty table.
pub fn locate(table: &CorrectionTable, target: f64) -> Option<Placement> {
    let keys = table.targets();
    if keys.is_empty() {
        return None;
    }
    if let Some(index) = table.position_of(target) {
        return Some(Placement::Exact(index));
    }
    if keys.len() == 1 {
        return Some(Placement::Beyond {
            lower: 0,
            fraction: 0.0,
        });
    }

    let segment = |lower: usize| {
        let (a, b) = (keys[lower], keys[lower + 1]);
        (target - a) / (b - a)
    };

    for lower in 0..keys.len() - 1 {
        let fraction = segment(lower);
        if (0.0..=1.0).contains(&fraction) {
            return Some(Placement::Between { lower, fraction });
        }
    }

    // Outside the keys: extrapolate from whichever edge is closer
    let last = keys.len() - 1;
    let lower = if (target - keys[0]).abs() <= (target - keys[last]).abs() {
        0
    } else {
        last - 1
    };
    Some(Placement::Beyond {
        lower,
        fraction: segment(lower),
    })
}

/// Table deltas at `target`, one per column
pub fn interpolate_deltas(table: &CorrectionTable, target: f64) -> Option<Vec<f64>> {
    let blend = |lower: usize, fraction: f64| -> Option<Vec<f64>> {
        let a = table.row(lower)?;
        let b = table.row(lower + 1).unwrap_or(a);
        Some(
            a.iter()
                .zip(b)
                .map(|(lo, hi)| lo + (hi - lo) * fraction)
                .collect(),
        )
    };

    match locate(table, target)? {
        Placement::Exact(index) => table.row(index).map(|row| row.to_vec()),
        Placement::Between { lower, fraction } | Placement::Beyond { lower, fraction } => {
            blend(lower, fraction)
        }
    }
}

/// Corrector setpoints that cancel drift at `target`
///
/// Returns `reference_start[i] + delta[i]` for every corrector, in the
/// calibration's corrector order. Targets outside the calibrated window are
/// extrapolated and reported with a warning and an `Extrapolated` event.
///
/// # Errors
/// `InvariantViolation` when `target` is not finite.
pub fn corrected_setpoints(
    calibration: &Calibration,
    target: f64,
) -> Result<Vec<f64>, CalibrationError> {
    if !target.is_finite() {
        return Err(CalibrationError::invariant(format!(
            "target {} is not finite",
            target
        )));
    }

    let table = calibration.correction_table();
    if let Some(Placement::Beyond { .. }) = locate(table, target) {
        let (low, high) = calibration.target_range();
        log::warn!(
            "[{}] target {} outside calibrated range [{}, {}]; extrapolating",
            CalibrationStage::Apply,
            target,
            low,
            high
        );
        telemetry::hub().publish(CalibrationEvent::Extrapolated { target, low, high });
    }

    let deltas = interpolate_deltas(table, target)
        .ok_or_else(|| CalibrationError::invariant("correction table is empty"))?;
    Ok(calibration
        .reference_start()
        .iter()
        .zip(deltas)
        .map(|(start, delta)| start + delta)
        .collect())
}
