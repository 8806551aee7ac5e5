//! Simulated motors and centroid probe.
//!
//! The probe follows a linear model: the centroid drifts by `drift_x` /
//! `drift_y` pixels per delay unit and each corrector shifts it by
//! `gain_x` / `gain_y` pixels per unit away from its starting position.
//! Optional seeded uniform noise keeps runs reproducible.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::MotionError;
use crate::hardware::{
    CancelToken, Centroid, Corrector, Hardware, LogicalAxis, MeasurementProbe, Positioner,
};

/// f64 position shared between a simulated motor and its observers
#[derive(Debug, Clone, Default)]
pub struct SharedPosition(Arc<AtomicU64>);

impl SharedPosition {
    pub fn new(value: f64) -> Self {
        Self(Arc::new(AtomicU64::new(value.to_bits())))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }
}

/// Injected move failures, counted in move attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPlan {
    #[default]
    Healthy,
    /// Only the attempt following the first `n` moves
    Once(usize),
    /// Every attempt following the first `n` moves
    From(usize),
}

impl FaultPlan {
    fn fails(&self, attempt: usize) -> bool {
        match *self {
            FaultPlan::Healthy => false,
            FaultPlan::Once(n) => attempt == n + 1,
            FaultPlan::From(n) => attempt > n,
        }
    }
}

/// Move-counting motor usable as a corrector or as the delay axis
#[derive(Debug)]
pub struct SimMotor {
    name: String,
    position: SharedPosition,
    moves: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    limits: Option<(f64, f64)>,
    faults: FaultPlan,
    settle: Duration,
}

impl SimMotor {
    pub fn new(name: &str, start: f64) -> Self {
        Self {
            name: name.to_string(),
            position: SharedPosition::new(start),
            moves: Arc::new(AtomicUsize::new(0)),
            stops: Arc::new(AtomicUsize::new(0)),
            limits: None,
            faults: FaultPlan::Healthy,
            settle: Duration::ZERO,
        }
    }

    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Block for `settle` on every accepted move
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn position_handle(&self) -> SharedPosition {
        self.position.clone()
    }

    pub fn move_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.moves)
    }

    pub fn stop_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stops)
    }
}

impl Positioner for SimMotor {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> Result<f64, MotionError> {
        Ok(self.position.get())
    }

    fn move_to(&mut self, target: f64, _timeout: Duration) -> Result<(), MotionError> {
        let attempt = self.moves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.faults.fails(attempt) {
            return Err(MotionError::Fault {
                motor: self.name.clone(),
                details: format!("injected fault on move {}", attempt),
            });
        }
        if let Some((low, high)) = self.limits {
            if target < low || target > high {
                return Err(MotionError::LimitExceeded {
                    motor: self.name.clone(),
                    target,
                    low,
                    high,
                });
            }
        }
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        self.position.set(target);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), MotionError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Corrector for SimMotor {}

impl LogicalAxis for SimMotor {}

struct CorrectorTerm {
    position: SharedPosition,
    origin: f64,
    gain_x: f64,
    gain_y: f64,
}

/// Centroid probe following the linear drift model
pub struct SimProbe {
    axis: SharedPosition,
    drift: (f64, f64),
    correctors: Vec<CorrectorTerm>,
    noise: Option<(StdRng, f64)>,
    samples: Arc<AtomicUsize>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl MeasurementProbe for SimProbe {
    fn sample(&mut self) -> Result<Centroid, MotionError> {
        let taken = self.samples.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((count, token)) = &self.cancel_after {
            if taken == *count {
                token.cancel();
            }
        }
        let delay = self.axis.get();
        let mut x = self.drift.0 * delay;
        let mut y = self.drift.1 * delay;
        for term in &self.correctors {
            let offset = term.position.get() - term.origin;
            x += term.gain_x * offset;
            y += term.gain_y * offset;
        }
        if let Some((rng, sigma)) = self.noise.as_mut() {
            if *sigma > 0.0 {
                x += rng.gen_range(-*sigma..=*sigma);
                y += rng.gen_range(-*sigma..=*sigma);
            }
        }
        Ok(Centroid::new(x, y))
    }
}

#[derive(Debug, Clone)]
struct CorrectorSetup {
    name: String,
    start: f64,
    gain_x: f64,
    gain_y: f64,
    limits: Option<(f64, f64)>,
    faults: FaultPlan,
}

/// Builder for a simulated delay axis, its correctors and probe
#[derive(Debug, Clone)]
pub struct SimBench {
    drift_x: f64,
    drift_y: f64,
    axis_start: f64,
    axis_faults: FaultPlan,
    correctors: Vec<CorrectorSetup>,
    noise: Option<(u64, f64)>,
    settle: Duration,
    cancel_after: Option<(usize, CancelToken)>,
}

impl SimBench {
    /// Bench whose centroid drifts by `drift_x` / `drift_y` pixels per delay unit
    pub fn new(drift_x: f64, drift_y: f64) -> Self {
        Self {
            drift_x,
            drift_y,
            axis_start: 0.0,
            axis_faults: FaultPlan::Healthy,
            correctors: Vec::new(),
            noise: None,
            settle: Duration::ZERO,
            cancel_after: None,
        }
    }

    pub fn axis_start(mut self, position: f64) -> Self {
        self.axis_start = position;
        self
    }

    /// The axis faults once, on the move after the first `moves`
    pub fn axis_fails_after(mut self, moves: usize) -> Self {
        self.axis_faults = FaultPlan::Once(moves);
        self
    }

    /// Attach a corrector at `start` moving the centroid by `gain_x` /
    /// `gain_y` pixels per unit
    pub fn corrector(mut self, name: &str, start: f64, gain_x: f64, gain_y: f64) -> Self {
        self.correctors.push(CorrectorSetup {
            name: name.to_string(),
            start,
            gain_x,
            gain_y,
            limits: None,
            faults: FaultPlan::Healthy,
        });
        self
    }

    /// Corrector `index` faults once, on the move after the first `moves`
    pub fn corrector_fails_after(self, index: usize, moves: usize) -> Self {
        self.with_corrector(index, |setup| setup.faults = FaultPlan::Once(moves))
    }

    /// Corrector `index` faults on every move after the first `moves`
    pub fn corrector_jams_after(self, index: usize, moves: usize) -> Self {
        self.with_corrector(index, |setup| setup.faults = FaultPlan::From(moves))
    }

    pub fn corrector_limits(self, index: usize, low: f64, high: f64) -> Self {
        self.with_corrector(index, |setup| setup.limits = Some((low, high)))
    }

    /// Uniform noise in `[-amplitude, amplitude]` pixels, seeded
    pub fn noise(mut self, seed: u64, amplitude: f64) -> Self {
        self.noise = Some((seed, amplitude));
        self
    }

    /// Every motor takes `settle` to complete a move
    pub fn settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Fire `token` as the probe takes its `samples`-th sample
    pub fn cancel_after_samples(mut self, token: CancelToken, samples: usize) -> Self {
        self.cancel_after = Some((samples, token));
        self
    }

    fn with_corrector(mut self, index: usize, edit: impl FnOnce(&mut CorrectorSetup)) -> Self {
        if let Some(setup) = self.correctors.get_mut(index) {
            edit(setup);
        }
        self
    }

    pub fn build(self) -> (Hardware, SimHandles) {
        let axis = SimMotor::new("delay", self.axis_start)
            .with_faults(self.axis_faults)
            .with_settle_time(self.settle);
        let mut handles = SimHandles {
            axis: axis.position_handle(),
            axis_moves: axis.move_counter(),
            axis_stops: axis.stop_counter(),
            correctors: Vec::with_capacity(self.correctors.len()),
            probe_samples: Arc::new(AtomicUsize::new(0)),
        };

        let mut correctors: Vec<Box<dyn Corrector>> = Vec::with_capacity(self.correctors.len());
        let mut terms = Vec::with_capacity(self.correctors.len());
        for setup in self.correctors {
            let mut motor = SimMotor::new(&setup.name, setup.start)
                .with_faults(setup.faults)
                .with_settle_time(self.settle);
            if let Some((low, high)) = setup.limits {
                motor = motor.with_limits(low, high);
            }
            handles.correctors.push(MotorHandles {
                position: motor.position_handle(),
                moves: motor.move_counter(),
                stops: motor.stop_counter(),
            });
            terms.push(CorrectorTerm {
                position: motor.position_handle(),
                origin: setup.start,
                gain_x: setup.gain_x,
                gain_y: setup.gain_y,
            });
            correctors.push(Box::new(motor));
        }

        let probe = SimProbe {
            axis: handles.axis.clone(),
            drift: (self.drift_x, self.drift_y),
            correctors: terms,
            noise: self
                .noise
                .map(|(seed, amplitude)| (StdRng::seed_from_u64(seed), amplitude)),
            samples: Arc::clone(&handles.probe_samples),
            cancel_after: self.cancel_after,
        };

        (
            Hardware::new(Box::new(axis), correctors, Box::new(probe)),
            handles,
        )
    }
}

#[derive(Debug, Clone)]
struct MotorHandles {
    position: SharedPosition,
    moves: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

/// Observers for a built [`SimBench`]
#[derive(Debug, Clone)]
pub struct SimHandles {
    axis: SharedPosition,
    axis_moves: Arc<AtomicUsize>,
    axis_stops: Arc<AtomicUsize>,
    correctors: Vec<MotorHandles>,
    probe_samples: Arc<AtomicUsize>,
}

impl SimHandles {
    pub fn axis_position(&self) -> f64 {
        self.axis.get()
    }

    /// Move attempts on the delay axis, failed ones included
    pub fn axis_moves(&self) -> usize {
        self.axis_moves.load(Ordering::SeqCst)
    }

    /// Position of corrector `index`; NaN when there is no such corrector
    pub fn corrector_position(&self, index: usize) -> f64 {
        self.correctors
            .get(index)
            .map(|motor| motor.position.get())
            .unwrap_or(f64::NAN)
    }

    pub fn corrector_moves(&self, index: usize) -> usize {
        self.correctors
            .get(index)
            .map(|motor| motor.moves.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// `stop()` calls received by the delay axis
    pub fn axis_stops(&self) -> usize {
        self.axis_stops.load(Ordering::SeqCst)
    }

    pub fn corrector_stops(&self, index: usize) -> usize {
        self.correctors
            .get(index)
            .map(|motor| motor.stops.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Move attempts across the axis and every corrector
    pub fn total_moves(&self) -> usize {
        self.axis_moves() + (0..self.correctors.len()).map(|i| self.corrector_moves(i)).sum::<usize>()
    }

    pub fn probe_samples(&self) -> usize {
        self.probe_samples.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_follows_drift_and_gain() {
        let (mut hw, _handles) = SimBench::new(0.1, -0.2)
            .corrector("tilt", 1.0, 2.0, 0.0)
            .build();
        hw.axis.move_to(10.0, Duration::from_secs(1)).unwrap();
        hw.correctors[0].move_to(1.5, Duration::from_secs(1)).unwrap();

        let c = hw.probe.sample().unwrap();
        assert!((c.x - 2.0).abs() < 1e-12);
        assert!((c.y + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_fault_plans() {
        assert!(!FaultPlan::Once(2).fails(2));
        assert!(FaultPlan::Once(2).fails(3));
        assert!(!FaultPlan::Once(2).fails(4));
        assert!(FaultPlan::From(2).fails(4));
        assert!(!FaultPlan::Healthy.fails(1));
    }

    #[test]
    fn test_limits_reject_move() {
        let mut motor = SimMotor::new("m", 0.0).with_limits(-1.0, 1.0);
        assert!(matches!(
            motor.move_to(2.0, Duration::from_secs(1)),
            Err(MotionError::LimitExceeded { .. })
        ));
        assert_eq!(motor.position().unwrap(), 0.0);
    }

    #[test]
    fn test_stop_is_counted() {
        let (mut hw, handles) = SimBench::new(0.0, 0.0)
            .corrector("tilt", 0.0, 1.0, 0.0)
            .build();
        hw.axis.stop().unwrap();
        hw.correctors[0].stop().unwrap();
        hw.correctors[0].stop().unwrap();
        assert_eq!(handles.axis_stops(), 1);
        assert_eq!(handles.corrector_stops(0), 2);
    }

    #[test]
    fn test_probe_fires_cancel_after_samples() {
        let token = CancelToken::new();
        let (mut hw, _handles) = SimBench::new(0.0, 0.0)
            .cancel_after_samples(token.clone(), 2)
            .build();
        hw.probe.sample().unwrap();
        assert!(!token.is_cancelled());
        hw.probe.sample().unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let sample = || {
            let (mut hw, _handles) = SimBench::new(0.0, 0.0).noise(7, 0.5).build();
            hw.probe.sample().unwrap()
        };
        let (a, b) = (sample(), sample());
        assert_eq!(a, b);
        assert!(a.x.abs() <= 0.5);
    }
}
