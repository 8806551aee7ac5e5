//! Simulation + test harness utilities.
//!
//! The simulated bench stands in for the delay axis, its correctors and the
//! centroid diagnostic so calibrations can run deterministically in unit
//! tests, integration tests and the `drift_cli simulate` command.

pub mod sim;

pub use sim::{FaultPlan, SharedPosition, SimBench, SimHandles, SimMotor, SimProbe};
