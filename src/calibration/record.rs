// ScanRecord - centroid samples taken along a drift scan
//
// One sample per scanned logical-axis target, in scan order. Targets are
// strictly monotonic, either ascending or descending.

use serde::{Deserialize, Serialize};

use crate::calibration::fit::fit_linear;
use crate::error::CalibrationError;

/// Centroid measured with the logical axis settled at `target`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanSample {
    pub target: f64,
    pub measured_x: f64,
    pub measured_y: f64,
}

impl ScanSample {
    pub fn new(target: f64, measured_x: f64, measured_y: f64) -> Self {
        Self {
            target,
            measured_x,
            measured_y,
        }
    }

    /// Measured pixel coordinate along a detector axis (0 = x, 1 = y)
    pub fn measured(&self, axis: usize) -> f64 {
        if axis == 0 {
            self.measured_x
        } else {
            self.measured_y
        }
    }

    fn is_finite(&self) -> bool {
        self.target.is_finite() && self.measured_x.is_finite() && self.measured_y.is_finite()
    }
}

/// Ordered drift-scan samples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanRecord {
    samples: Vec<ScanSample>,
}

impl ScanRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from existing samples, checking finiteness and
    /// strict monotonicity of the targets
    pub fn from_samples(samples: Vec<ScanSample>) -> Result<Self, CalibrationError> {
        if let Some(i) = samples.iter().position(|s| !s.is_finite()) {
            return Err(CalibrationError::invariant(format!(
                "scan sample {} is not finite",
                i
            )));
        }
        let record = Self { samples };
        if !record.is_monotonic() {
            return Err(CalibrationError::invariant(
                "scan targets are not strictly monotonic",
            ));
        }
        Ok(record)
    }

    pub(crate) fn push(&mut self, sample: ScanSample) {
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[ScanSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first(&self) -> Option<&ScanSample> {
        self.samples.first()
    }

    pub fn targets(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.target).collect()
    }

    /// Whether targets strictly increase or strictly decrease
    pub fn is_monotonic(&self) -> bool {
        let ascending = self.samples.windows(2).all(|w| w[1].target > w[0].target);
        let descending = self.samples.windows(2).all(|w| w[1].target < w[0].target);
        ascending || descending
    }

    /// Least-squares drift of (x, y) in pixels per delay unit
    ///
    /// Returns `None` with fewer than two samples.
    pub fn drift_rate(&self) -> Option<(f64, f64)> {
        let targets = self.targets();
        let xs: Vec<f64> = self.samples.iter().map(|s| s.measured_x).collect();
        let ys: Vec<f64> = self.samples.iter().map(|s| s.measured_y).collect();
        let fit_x = fit_linear(&targets, &xs)?;
        let fit_y = fit_linear(&targets, &ys)?;
        Some((fit_x.slope, fit_y.slope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(targets: &[f64]) -> Result<ScanRecord, CalibrationError> {
        ScanRecord::from_samples(
            targets
                .iter()
                .map(|&t| ScanSample::new(t, 0.1 * t, -0.2 * t))
                .collect(),
        )
    }

    #[test]
    fn test_monotonic_records_accepted() {
        assert!(record(&[0.0, 5.0, 10.0]).is_ok());
        assert!(record(&[10.0, 5.0, 0.0]).is_ok());
        assert!(record(&[3.0]).is_ok());
    }

    #[test]
    fn test_non_monotonic_rejected() {
        assert!(matches!(
            record(&[0.0, 5.0, 5.0]),
            Err(CalibrationError::InvariantViolation { .. })
        ));
        assert!(record(&[0.0, 5.0, 2.0]).is_err());
    }

    #[test]
    fn test_non_finite_rejected() {
        let result = ScanRecord::from_samples(vec![ScanSample::new(0.0, f64::NAN, 0.0)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_drift_rate() {
        let rec = record(&[0.0, 5.0, 10.0]).unwrap();
        let (dx, dy) = rec.drift_rate().unwrap();
        assert!((dx - 0.1).abs() < 1e-12);
        assert!((dy + 0.2).abs() < 1e-12);
        assert!(record(&[1.0]).unwrap().drift_rate().is_none());
    }
}
