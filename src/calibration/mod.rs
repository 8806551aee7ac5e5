// Calibration module - drift characterization and correction
//
// This module provides the pieces of the drift-correction engine:
// 1. ScanRecord / CorrectionTable / Calibration: the persisted data
// 2. DriftScanner and CorrectorWalk: the two measurement routines
// 3. CalibrationBuilder: runs both and assembles a Calibration
// 4. corrected_setpoints: applies a Calibration to a logical-axis target
// 5. CalibrationStore: JSON persistence by name
//
// The calibration workflow:
// 1. Scan the logical axis and record centroid drift
// 2. Walk each corrector to fit its sensitivity
// 3. Build the correction table and save it as "current"

pub mod applier;
pub mod fit;
pub mod inspect;
pub mod procedure;
pub mod record;
pub mod scan;
pub mod smoothing;
pub mod state;
pub mod store;
pub mod table;
pub mod walk;

pub use applier::{corrected_setpoints, interpolate_deltas, locate, Placement};
pub use fit::{fit_linear, LinearFit};
pub use inspect::{render_centroid_chart, render_centroid_table};
pub use procedure::{build_table, CalibrationBuilder, Snapshot, MAX_CORRECTORS};
pub use record::{ScanRecord, ScanSample};
pub use scan::{scan_targets, DriftScanner};
pub use smoothing::{savgol_filter, smooth_table};
pub use state::{Calibration, CalibrationChanges, CalibrationFlags};
pub use store::{CalibrationFile, CalibrationStore, CURRENT};
pub use table::CorrectionTable;
pub use walk::{CorrectorWalk, WalkResult};
