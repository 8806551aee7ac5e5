// Blocking motion helpers shared by scans, walks and corrected moves

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::MotionConfig;
use crate::error::{CalibrationError, CalibrationStage, MotionError};
use crate::hardware::{Centroid, MeasurementProbe, Positioner};

/// Shared interrupt flag checked before every move of a routine
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the running routine stop at its next move
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clear a previous request before starting a new routine
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` if an interrupt is pending
    pub fn check(&self, stage: CalibrationStage) -> Result<(), CalibrationError> {
        if self.is_cancelled() {
            return Err(CalibrationError::Cancelled { stage });
        }
        Ok(())
    }
}

/// Move and wait for settle, retrying transient failures
///
/// Each attempt is bounded by the configured settle timeout. Settling failures
/// are retried up to `settle_retries` extra times; any other failure returns
/// immediately.
pub fn move_settled<M: Positioner + ?Sized>(
    motor: &mut M,
    target: f64,
    config: &MotionConfig,
) -> Result<(), MotionError> {
    let timeout = config.settle_timeout();
    let mut attempt = 0;
    loop {
        match motor.move_to(target, timeout) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < config.settle_retries => {
                attempt += 1;
                log::warn!(
                    "[Motion] {} not settled at {} (attempt {}/{}): {}",
                    motor.name(),
                    target,
                    attempt,
                    config.settle_retries,
                    err
                );
            }
            Err(err) => return Err(err),
        }
    }
}

/// Average `count` probe samples into one centroid
pub fn measure_average<P: MeasurementProbe + ?Sized>(
    probe: &mut P,
    count: usize,
) -> Result<Centroid, MotionError> {
    let count = count.max(1);
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        samples.push(probe.sample()?);
    }
    Centroid::mean(&samples).ok_or(MotionError::Probe {
        details: "no samples taken".to_string(),
    })
}
