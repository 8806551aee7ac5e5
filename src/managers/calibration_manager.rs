// CalibrationManager: Focused manager for calibration state
//
// Single Responsibility: the loaded calibration, its flags and the most
// recent drift scan, shared between the routine that writes them and any
// number of readers.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::calibration::{Calibration, CalibrationFlags, ScanRecord};
use crate::error::{log_calibration_error, CalibrationError};

#[derive(Debug, Default)]
struct CalibrationSlot {
    calibration: Option<Calibration>,
    flags: CalibrationFlags,
}

/// Manages the process-wide calibration state of one logical axis
///
/// This manager handles:
/// - Installing and replacing the loaded calibration
/// - The `has_calibration` / `use_calibration` flags
/// - The overwrite guard for new calibrations
/// - The most recent completed drift scan
/// - Thread-safe lock management
///
/// # Example
/// ```ignore
/// let manager = CalibrationManager::new();
/// manager.check_overwrite(false)?;
/// manager.install(calibration)?;
/// let active = manager.active_calibration()?;
/// ```
pub struct CalibrationManager {
    slot: Arc<RwLock<CalibrationSlot>>,
    last_scan: Arc<RwLock<Option<ScanRecord>>>,
}

impl CalibrationManager {
    /// Create a manager with no calibration and no scan
    pub fn new() -> Self {
        Self {
            slot: Arc::new(RwLock::new(CalibrationSlot::default())),
            last_scan: Arc::new(RwLock::new(None)),
        }
    }

    /// Refuse to replace a loaded calibration without confirmation
    ///
    /// # Errors
    /// - `CalibrationExists` when a calibration is loaded and `confirm` is false
    /// - Lock poisoning on calibration state
    pub fn check_overwrite(&self, confirm: bool) -> Result<(), CalibrationError> {
        let slot = self.read_slot()?;
        if slot.flags.has_calibration && !confirm {
            let err = CalibrationError::CalibrationExists;
            log_calibration_error(&err, "check_overwrite");
            return Err(err);
        }
        Ok(())
    }

    /// Install a calibration and enable corrections
    pub fn install(&self, calibration: Calibration) -> Result<(), CalibrationError> {
        let mut slot = self.write_slot().inspect_err(|err| {
            log_calibration_error(err, "install_calibration");
        })?;
        slot.calibration = Some(calibration);
        slot.flags = CalibrationFlags {
            has_calibration: true,
            use_calibration: true,
        };
        Ok(())
    }

    /// Swap in a modified calibration, keeping the `use_calibration` choice
    pub fn replace(&self, calibration: Calibration) -> Result<(), CalibrationError> {
        let mut slot = self.write_slot().inspect_err(|err| {
            log_calibration_error(err, "replace_calibration");
        })?;
        slot.calibration = Some(calibration);
        slot.flags.has_calibration = true;
        Ok(())
    }

    /// Clone of the loaded calibration, if any
    pub fn calibration(&self) -> Result<Option<Calibration>, CalibrationError> {
        Ok(self.read_slot()?.calibration.clone())
    }

    /// Loaded calibration, or `NoCalibration`
    pub fn require_calibration(&self) -> Result<Calibration, CalibrationError> {
        self.calibration()?.ok_or(CalibrationError::NoCalibration)
    }

    /// Calibration to apply on moves: loaded and enabled
    pub fn active_calibration(&self) -> Result<Option<Calibration>, CalibrationError> {
        let slot = self.read_slot()?;
        if slot.flags.is_active() {
            Ok(slot.calibration.clone())
        } else {
            Ok(None)
        }
    }

    pub fn flags(&self) -> Result<CalibrationFlags, CalibrationError> {
        Ok(self.read_slot()?.flags)
    }

    /// Enable or disable corrections
    ///
    /// # Errors
    /// `NoCalibration` when enabling without a loaded calibration.
    pub fn set_use_calibration(&self, enabled: bool) -> Result<(), CalibrationError> {
        let mut slot = self.write_slot()?;
        if enabled && !slot.flags.has_calibration {
            let err = CalibrationError::NoCalibration;
            log_calibration_error(&err, "set_use_calibration");
            return Err(err);
        }
        slot.flags.use_calibration = enabled;
        Ok(())
    }

    /// Remember a completed scan for later inspection
    pub fn record_scan(&self, record: ScanRecord) -> Result<(), CalibrationError> {
        let mut guard = self
            .last_scan
            .write()
            .map_err(|_| CalibrationError::StatePoisoned)?;
        *guard = Some(record);
        Ok(())
    }

    /// Most recent completed scan
    ///
    /// # Errors
    /// `NoScan` before any scan has completed.
    pub fn last_scan(&self) -> Result<ScanRecord, CalibrationError> {
        self.last_scan
            .read()
            .map_err(|_| CalibrationError::StatePoisoned)?
            .clone()
            .ok_or(CalibrationError::NoScan)
    }

    // ========================================================================
    // HELPER METHODS - Lock management
    // ========================================================================

    /// Safely acquire read lock on calibration state
    fn read_slot(&self) -> Result<RwLockReadGuard<'_, CalibrationSlot>, CalibrationError> {
        self.slot.read().map_err(|_| CalibrationError::StatePoisoned)
    }

    /// Safely acquire write lock on calibration state
    fn write_slot(&self) -> Result<RwLockWriteGuard<'_, CalibrationSlot>, CalibrationError> {
        self.slot.write().map_err(|_| CalibrationError::StatePoisoned)
    }
}

impl Default for CalibrationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CorrectionTable, ScanSample};

    fn calibration() -> Calibration {
        let scan = ScanRecord::from_samples(vec![
            ScanSample::new(0.0, 0.0, 0.0),
            ScanSample::new(1.0, 0.1, 0.0),
        ])
        .unwrap();
        let table =
            CorrectionTable::from_rows(vec![0.0, 1.0], vec![vec![0.0], vec![0.2]]).unwrap();
        Calibration::new(table, vec!["tilt".to_string()], scan, vec![2.0], vec![0.0]).unwrap()
    }

    #[test]
    fn test_new() {
        let manager = CalibrationManager::new();
        assert_eq!(manager.flags().unwrap(), CalibrationFlags::default());
        assert!(manager.calibration().unwrap().is_none());
        assert!(matches!(manager.last_scan(), Err(CalibrationError::NoScan)));
    }

    #[test]
    fn test_install_enables_corrections() {
        let manager = CalibrationManager::new();
        manager.install(calibration()).unwrap();

        assert!(manager.flags().unwrap().is_active());
        assert!(manager.active_calibration().unwrap().is_some());
    }

    #[test]
    fn test_overwrite_requires_confirmation() {
        let manager = CalibrationManager::new();
        assert!(manager.check_overwrite(false).is_ok());

        manager.install(calibration()).unwrap();
        assert!(matches!(
            manager.check_overwrite(false),
            Err(CalibrationError::CalibrationExists)
        ));
        assert!(manager.check_overwrite(true).is_ok());
    }

    #[test]
    fn test_disabled_calibration_is_not_active() {
        let manager = CalibrationManager::new();
        manager.install(calibration()).unwrap();
        manager.set_use_calibration(false).unwrap();

        assert!(manager.active_calibration().unwrap().is_none());
        assert!(manager.calibration().unwrap().is_some());
    }

    #[test]
    fn test_replace_keeps_use_flag() {
        let manager = CalibrationManager::new();
        manager.install(calibration()).unwrap();
        manager.set_use_calibration(false).unwrap();
        manager.replace(calibration()).unwrap();

        assert!(!manager.flags().unwrap().use_calibration);
    }

    #[test]
    fn test_enable_without_calibration_fails() {
        let manager = CalibrationManager::new();
        assert!(matches!(
            manager.set_use_calibration(true),
            Err(CalibrationError::NoCalibration)
        ));
        assert!(manager.set_use_calibration(false).is_ok());
    }

    #[test]
    fn test_record_scan() {
        let manager = CalibrationManager::new();
        let record = calibration().scan_record().clone();
        manager.record_scan(record.clone()).unwrap();
        assert_eq!(manager.last_scan().unwrap(), record);
    }
}
