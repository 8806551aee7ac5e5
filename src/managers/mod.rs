// Managers Module
//
// Focused manager classes for the delay axis.
//
// Each manager handles one specific concern:
// - CalibrationManager: loaded calibration, flags and last scan
// - DelayMacro: hardware ownership, routines and corrected moves

pub mod calibration_manager;
pub mod delay_macro;

pub use calibration_manager::CalibrationManager;
pub use delay_macro::DelayMacro;
