// Delay Drift Core - drift calibration for a compound delay axis
// Measures beam-centroid drift along the axis and cancels it with corrector motors

// Module declarations
pub mod calibration;
pub mod config;
pub mod error;
pub mod hardware;
pub mod managers;
pub mod telemetry;
pub mod testing;

// Re-exports for convenience
pub use calibration::{
    corrected_setpoints, Calibration, CalibrationChanges, CalibrationFlags, CalibrationStore,
    CorrectionTable, ScanRecord, ScanSample,
};
pub use config::EngineConfig;
pub use error::{CalibrationError, CalibrationStage, ErrorCode, MotionError};
pub use hardware::{CancelToken, Centroid, Corrector, Hardware, LogicalAxis, MeasurementProbe};
pub use managers::DelayMacro;

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_level`. `log` records from the library are bridged through it.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
    {
        log::debug!("Logging initialised");
    }
}
