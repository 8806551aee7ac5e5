// Corrector walk - sensitivity of the centroid to one corrector
//
// The corrector is swept through a small symmetric window around its
// reference start while the logical axis is held still. A straight line
// through (displacement, pixel) gives the corrector's sensitivity; its
// negative reciprocal is the scale used to cancel drift.

use crate::calibration::fit::{fit_linear, LinearFit};
use crate::config::{MotionConfig, WalkConfig};
use crate::error::{CalibrationError, CalibrationStage};
use crate::hardware::{measure_average, move_settled, CancelToken, Corrector, MeasurementProbe};
use crate::telemetry::{self, CalibrationEvent};

/// Result of walking one corrector
#[derive(Debug, Clone, PartialEq)]
pub struct WalkResult {
    pub corrector: String,
    /// Readback displacement from the reference start at each sweep point
    pub displacements: Vec<f64>,
    /// Centroid coordinate on the corrector's detector axis at each point
    pub pixels: Vec<f64>,
    /// Pixels per corrector unit
    pub fit: LinearFit,
    /// Corrector units that cancel one pixel of drift
    pub scale: f64,
}

/// Symmetric sweep offsets from `-half_width` to `half_width`
pub fn walk_offsets(half_width: f64, points: usize) -> Vec<f64> {
    let points = points.max(2);
    let span = 2.0 * half_width;
    (0..points)
        .map(|i| -half_width + span * i as f64 / (points - 1) as f64)
        .collect()
}

/// Turn a fitted sensitivity into a correction scale
///
/// # Errors
/// `DegenerateFit` when |slope| is below `min_sensitivity`.
pub fn scale_from_fit(
    corrector: &str,
    fit: &LinearFit,
    min_sensitivity: f64,
) -> Result<f64, CalibrationError> {
    if !fit.slope.is_finite() || fit.slope.abs() < min_sensitivity {
        return Err(CalibrationError::DegenerateFit {
            corrector: corrector.to_string(),
            slope: fit.slope,
            threshold: min_sensitivity,
        });
    }
    Ok(-1.0 / fit.slope)
}

pub struct CorrectorWalk<'a> {
    walk: &'a WalkConfig,
    motion: &'a MotionConfig,
    average: usize,
    cancel: &'a CancelToken,
}

impl<'a> CorrectorWalk<'a> {
    pub fn new(
        walk: &'a WalkConfig,
        motion: &'a MotionConfig,
        average: usize,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            walk,
            motion,
            average,
            cancel,
        }
    }

    /// Sweep `corrector` around `reference` and fit its sensitivity along
    /// `pixel_axis` (0 = x, 1 = y). The corrector is returned to `reference`
    /// when the sweep succeeds.
    pub fn walk<C, P>(
        &self,
        corrector: &mut C,
        probe: &mut P,
        pixel_axis: usize,
        reference: f64,
    ) -> Result<WalkResult, CalibrationError>
    where
        C: Corrector + ?Sized,
        P: MeasurementProbe + ?Sized,
    {
        let name = corrector.name().to_string();
        let offsets = walk_offsets(self.walk.half_width, self.walk.points);
        log::info!(
            "[Walk] {} around {} over ±{} ({} points)",
            name,
            reference,
            self.walk.half_width,
            offsets.len()
        );

        let motion_err = |source| CalibrationError::motion(CalibrationStage::Walk, source);
        let mut displacements = Vec::with_capacity(offsets.len());
        let mut pixels = Vec::with_capacity(offsets.len());
        for offset in offsets {
            self.cancel.check(CalibrationStage::Walk)?;
            move_settled(corrector, reference + offset, self.motion).map_err(motion_err)?;
            let displacement = corrector.position().map_err(motion_err)? - reference;
            let pixel = measure_average(probe, self.average)
                .map_err(motion_err)?
                .axis(pixel_axis);

            telemetry::hub().publish(CalibrationEvent::WalkStep {
                corrector: name.clone(),
                displacement,
                pixel,
            });
            displacements.push(displacement);
            pixels.push(pixel);
        }

        self.cancel.check(CalibrationStage::Walk)?;
        move_settled(corrector, reference, self.motion).map_err(motion_err)?;

        let fit = fit_linear(&displacements, &pixels).ok_or_else(|| {
            let readback = reference + displacements.first().copied().unwrap_or(0.0);
            log::error!("[Walk] {} readback stayed at {}", name, readback);
            CalibrationError::FlatSweep {
                corrector: name.clone(),
                readback,
            }
        })?;
        let scale = scale_from_fit(&name, &fit, self.walk.min_sensitivity)?;

        tracing::info!(
            "[Walk] {} slope={:.6e} px/unit r2={:.4} scale={:.6e} unit/px",
            name,
            fit.slope,
            fit.r_squared,
            scale
        );
        telemetry::hub().publish(CalibrationEvent::ScaleFitted {
            corrector: name.clone(),
            slope: fit.slope,
            scale,
            r_squared: fit.r_squared,
        });

        Ok(WalkResult {
            corrector: name,
            displacements,
            pixels,
            fit,
            scale,
        })
    }
}
