//! Hardware collaborators consumed by the drift engine.
//!
//! The engine never talks to PVs directly. It drives three kinds of
//! collaborator through these traits:
//!
//! - [`LogicalAxis`]: the compound delay axis users move, in delay units
//! - [`Corrector`]: a motor dedicated to cancelling beam drift
//! - [`MeasurementProbe`]: a synchronous beam-centroid measurement
//!
//! Moves block until the motor reports settled or the supplied timeout
//! expires.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, MotionError};

pub mod motion;

pub use motion::{measure_average, move_settled, CancelToken};

/// Beam centroid sample in pixel units
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Centroid {
    pub x: f64,
    pub y: f64,
}

impl Centroid {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Pixel coordinate along a detector axis (0 = x, anything else = y)
    pub fn axis(&self, index: usize) -> f64 {
        if index == 0 {
            self.x
        } else {
            self.y
        }
    }

    /// Mean of a non-empty set of samples
    pub fn mean(samples: &[Centroid]) -> Option<Centroid> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let (sx, sy) = samples
            .iter()
            .fold((0.0, 0.0), |(ax, ay), c| (ax + c.x, ay + c.y));
        Some(Centroid::new(sx / n, sy / n))
    }
}

/// Anything with a readable position and a blocking move
pub trait Positioner: Send {
    /// Identity used in calibration files and logs
    fn name(&self) -> &str;

    /// Current readback position
    fn position(&self) -> Result<f64, MotionError>;

    /// Command a move and block until settled or `timeout` expires
    fn move_to(&mut self, target: f64, timeout: Duration) -> Result<(), MotionError>;

    /// Halt any motion in progress
    fn stop(&mut self) -> Result<(), MotionError> {
        Ok(())
    }
}

/// Motor used to cancel measured beam drift
pub trait Corrector: Positioner {}

/// Compound axis moved by users, positioned in delay units
pub trait LogicalAxis: Positioner {}

/// Beam-centroid diagnostic
pub trait MeasurementProbe: Send {
    /// Take one centroid sample, blocking until it is available
    fn sample(&mut self) -> Result<Centroid, MotionError>;
}

/// Devices attached to one delay axis
pub struct Hardware {
    pub axis: Box<dyn LogicalAxis>,
    pub correctors: Vec<Box<dyn Corrector>>,
    pub probe: Box<dyn MeasurementProbe>,
}

impl Hardware {
    pub fn new(
        axis: Box<dyn LogicalAxis>,
        correctors: Vec<Box<dyn Corrector>>,
        probe: Box<dyn MeasurementProbe>,
    ) -> Self {
        Self {
            axis,
            correctors,
            probe,
        }
    }

    pub fn corrector_names(&self) -> Vec<String> {
        self.correctors.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn corrector_index(&self, name: &str) -> Option<usize> {
        self.correctors.iter().position(|c| c.name() == name)
    }

    /// Borrow the axis, the probe and the named correctors in the given order
    ///
    /// # Errors
    /// `UnknownCorrector` for a name that is not attached, `InvariantViolation`
    /// when a name is repeated.
    pub fn select<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Rig<'_>, CalibrationError> {
        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let index = self
                .corrector_index(name)
                .ok_or_else(|| CalibrationError::UnknownCorrector {
                    name: name.to_string(),
                })?;
            if indices.contains(&index) {
                return Err(CalibrationError::invariant(format!(
                    "corrector '{}' selected twice",
                    name
                )));
            }
            indices.push(index);
        }

        let mut slots: Vec<Option<&mut Box<dyn Corrector>>> =
            self.correctors.iter_mut().map(Some).collect();
        let mut correctors: Vec<&mut dyn Corrector> = Vec::with_capacity(indices.len());
        for index in indices {
            if let Some(slot) = slots[index].take() {
                correctors.push(&mut **slot);
            }
        }

        Ok(Rig {
            axis: &mut *self.axis,
            correctors,
            probe: &mut *self.probe,
        })
    }
}

/// Exclusive borrow of the devices used by one routine
pub struct Rig<'a> {
    pub axis: &'a mut dyn LogicalAxis,
    /// Selected correctors; index 0 cancels x drift, index 1 cancels y drift
    pub correctors: Vec<&'a mut dyn Corrector>,
    pub probe: &'a mut dyn MeasurementProbe,
}

impl Rig<'_> {
    pub fn corrector_names(&self) -> Vec<String> {
        self.correctors.iter().map(|c| c.name().to_string()).collect()
    }
}
