// DelayMacro: compound delay axis with drift correction
//
// Owns the hardware behind a mutex that doubles as the routine lock. Every
// operation that reads and then rewrites the calibration state (calibrate,
// rescale, configure, smooth, load, corrected move) takes it first and holds
// it until the new state is installed. A second caller meanwhile fails with
// AlreadyInProgress instead of waiting.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::calibration::{
    corrected_setpoints, render_centroid_chart, render_centroid_table, smooth_table, Calibration,
    CalibrationBuilder, CalibrationChanges, CalibrationFlags, CalibrationStore, DriftScanner,
    ScanRecord, CURRENT,
};
use crate::config::EngineConfig;
use crate::error::{log_calibration_error, CalibrationError, CalibrationStage};
use crate::hardware::{move_settled, CancelToken, Hardware, Positioner};
use crate::managers::CalibrationManager;
use crate::telemetry;

/// Logical delay axis whose moves are drift-corrected once calibrated
pub struct DelayMacro {
    hardware: Mutex<Hardware>,
    corrector_names: Vec<String>,
    manager: CalibrationManager,
    store: CalibrationStore,
    config: EngineConfig,
    cancel: CancelToken,
}

impl DelayMacro {
    /// Wrap `hardware`, persisting calibrations where `config.storage` says
    pub fn new(hardware: Hardware, config: EngineConfig) -> Self {
        let store = CalibrationStore::from_config(&config.storage);
        Self::with_store(hardware, config, store)
    }

    pub fn with_store(hardware: Hardware, config: EngineConfig, store: CalibrationStore) -> Self {
        let corrector_names = hardware.corrector_names();
        Self {
            hardware: Mutex::new(hardware),
            corrector_names,
            manager: CalibrationManager::new(),
            store,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Token that interrupts the running routine at its next move
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Names of the attached correctors
    pub fn corrector_names(&self) -> &[String] {
        &self.corrector_names
    }

    // ========================================================================
    // MOTION
    // ========================================================================

    /// Logical axis readback
    pub fn position(&self) -> Result<f64, CalibrationError> {
        let hardware = self.lock_hardware()?;
        hardware
            .axis
            .position()
            .map_err(|source| CalibrationError::motion(CalibrationStage::Apply, source))
    }

    /// Move the logical axis, correcting drift when a calibration is active
    ///
    /// The axis moves first, then each corrector to its setpoint. Without an
    /// active calibration only the axis moves.
    pub fn move_to(&self, target: f64) -> Result<(), CalibrationError> {
        let mut hardware = self.lock_hardware()?;
        let active = self.manager.active_calibration()?;

        let corrections = match &active {
            Some(calibration) => {
                let setpoints = corrected_setpoints(calibration, target)?;
                let mut moves = Vec::with_capacity(setpoints.len());
                for (name, setpoint) in calibration.correctors().iter().zip(setpoints) {
                    let index = hardware.corrector_index(name).ok_or_else(|| {
                        CalibrationError::UnknownCorrector { name: name.clone() }
                    })?;
                    moves.push((index, setpoint));
                }
                moves
            }
            None => Vec::new(),
        };

        let apply_err = |source| CalibrationError::motion(CalibrationStage::Apply, source);
        move_settled(hardware.axis.as_mut(), target, &self.config.motion)
            .map_err(apply_err)
            .inspect_err(|err| self.report(err, "move_to"))?;
        for (index, setpoint) in corrections {
            let corrector = hardware.correctors[index].as_mut();
            log::debug!("[Apply] {} -> {}", corrector.name(), setpoint);
            move_settled(corrector, setpoint, &self.config.motion)
                .map_err(apply_err)
                .inspect_err(|err| self.report(err, "move_to"))?;
        }
        Ok(())
    }

    // ========================================================================
    // ROUTINES
    // ========================================================================

    /// Build a new calibration and make it current
    ///
    /// With a calibration already loaded, `confirm_overwrite` must be true;
    /// otherwise this fails with `CalibrationExists` before any motion. On
    /// success the calibration is installed, corrections are enabled and it
    /// is saved under [`CURRENT`]. When only the final restore fails the
    /// calibration is still installed and saved before `Unrestored` is
    /// returned.
    pub fn calibrate(
        &self,
        start: f64,
        stop: f64,
        step: f64,
        correctors: &[&str],
        confirm_overwrite: bool,
    ) -> Result<Calibration, CalibrationError> {
        let _span = tracing::info_span!("calibrate", start, stop, step).entered();
        let mut hardware = self.lock_hardware()?;
        self.manager.check_overwrite(confirm_overwrite)?;
        self.cancel.reset();

        let mut rig = hardware.select(correctors)?;
        let builder = CalibrationBuilder::new(&self.config, &self.cancel);
        let outcome = builder.calibrate(&mut rig, start, stop, step, |record| {
            if let Err(err) = self.manager.record_scan(record.clone()) {
                log::warn!("[Scan] could not retain scan: {}", err);
            }
        });

        match outcome {
            Ok(calibration) => {
                self.adopt(&calibration)?;
                tracing::info!("[Calibrate] complete\n{}", calibration.summary());
                Ok(calibration)
            }
            Err(CalibrationError::Unrestored {
                calibration,
                source,
            }) => {
                self.adopt(&calibration)?;
                let err = CalibrationError::Unrestored {
                    calibration,
                    source,
                };
                self.report(&err, "calibrate");
                Err(err)
            }
            Err(err) => {
                self.report(&err, "calibrate");
                Err(err)
            }
        }
    }

    /// Drift scan only; the axis is left at the last target
    pub fn centroid_scan(
        &self,
        start: f64,
        stop: f64,
        step: f64,
    ) -> Result<ScanRecord, CalibrationError> {
        let mut hardware = self.lock_hardware()?;
        self.cancel.reset();

        let hardware = &mut *hardware;
        let scanner = DriftScanner::new(&self.config.motion, &self.config.scan, &self.cancel);
        let record = scanner
            .scan(hardware.axis.as_mut(), hardware.probe.as_mut(), start, stop, step)
            .inspect_err(|err| self.report(err, "centroid_scan"))?;
        self.manager.record_scan(record.clone())?;
        Ok(record)
    }

    /// Re-walk the correctors of the loaded calibration against its stored scan
    ///
    /// A rescale whose walk finished but whose restore failed still replaces
    /// the loaded calibration before `Unrestored` is returned.
    pub fn rescale_calibration(&self) -> Result<Calibration, CalibrationError> {
        let _span = tracing::info_span!("rescale").entered();
        let mut hardware = self.lock_hardware()?;
        let current = self.manager.require_calibration()?;
        self.cancel.reset();

        let mut rig = hardware.select(current.correctors())?;
        let builder = CalibrationBuilder::new(&self.config, &self.cancel);
        match builder.rescale(&mut rig, &current) {
            Ok(rescaled) => {
                self.manager.replace(rescaled.clone())?;
                Ok(rescaled)
            }
            Err(CalibrationError::Unrestored {
                calibration,
                source,
            }) => {
                self.manager.replace((*calibration).clone())?;
                let err = CalibrationError::Unrestored {
                    calibration,
                    source,
                };
                self.report(&err, "rescale_calibration");
                Err(err)
            }
            Err(err) => {
                self.report(&err, "rescale_calibration");
                Err(err)
            }
        }
    }

    // ========================================================================
    // CALIBRATION STATE
    // ========================================================================

    /// Replace fields of the loaded calibration
    pub fn configure(&self, changes: CalibrationChanges) -> Result<Calibration, CalibrationError> {
        let _hardware = self.lock_hardware()?;
        self.reconfigure_current(changes)
    }

    /// Savitzky-Golay smooth the loaded correction table
    ///
    /// `None` falls back to the configured window and order.
    pub fn smooth_calibration(
        &self,
        window_length: Option<usize>,
        polyorder: Option<usize>,
    ) -> Result<Calibration, CalibrationError> {
        let _hardware = self.lock_hardware()?;
        let current = self.manager.require_calibration()?;
        let table = smooth_table(
            current.correction_table(),
            window_length.unwrap_or(self.config.smoothing.window_length),
            polyorder.unwrap_or(self.config.smoothing.polyorder),
        )
        .inspect_err(|err| self.report(err, "smooth_calibration"))?;
        self.reconfigure_current(CalibrationChanges::new().correction_table(table))
    }

    /// Save the loaded calibration under a name or path
    pub fn save_calibration(&self, name_or_path: &str) -> Result<PathBuf, CalibrationError> {
        let current = self.manager.require_calibration()?;
        self.store
            .save(&current, name_or_path)
            .inspect_err(|err| self.report(err, "save_calibration"))
    }

    /// Load a stored calibration and enable it
    ///
    /// # Errors
    /// - `CalibrationNotFound` / `CalibrationFormat` from the store
    /// - `UnknownCorrector` when it drives a corrector that is not attached
    pub fn load_calibration(&self, name_or_path: &str) -> Result<Calibration, CalibrationError> {
        let _hardware = self.lock_hardware()?;
        let calibration = self
            .store
            .load(name_or_path)
            .inspect_err(|err| self.report(err, "load_calibration"))?;
        self.check_attached(&calibration)
            .inspect_err(|err| self.report(err, "load_calibration"))?;
        self.manager.install(calibration.clone())?;
        Ok(calibration)
    }

    pub fn calibration(&self) -> Result<Option<Calibration>, CalibrationError> {
        self.manager.calibration()
    }

    pub fn flags(&self) -> Result<CalibrationFlags, CalibrationError> {
        self.manager.flags()
    }

    pub fn has_calibration(&self) -> Result<bool, CalibrationError> {
        Ok(self.manager.flags()?.has_calibration)
    }

    pub fn use_calibration(&self) -> Result<bool, CalibrationError> {
        Ok(self.manager.flags()?.use_calibration)
    }

    pub fn set_use_calibration(&self, enabled: bool) -> Result<(), CalibrationError> {
        self.manager.set_use_calibration(enabled)
    }

    /// Setpoints the correctors would receive for `target`
    pub fn corrected_setpoints(&self, target: f64) -> Result<Vec<f64>, CalibrationError> {
        corrected_setpoints(&self.manager.require_calibration()?, target)
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    /// Most recent completed scan
    pub fn last_scan(&self) -> Result<ScanRecord, CalibrationError> {
        self.manager.last_scan()
    }

    pub fn view_centroids(&self) -> Result<String, CalibrationError> {
        Ok(render_centroid_table(&self.manager.last_scan()?))
    }

    pub fn graph_centroids(&self, width: usize, height: usize) -> Result<String, CalibrationError> {
        Ok(render_centroid_chart(&self.manager.last_scan()?, width, height))
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    /// Acquire the hardware without waiting
    fn lock_hardware(&self) -> Result<MutexGuard<'_, Hardware>, CalibrationError> {
        match self.hardware.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => {
                let err = CalibrationError::AlreadyInProgress;
                log_calibration_error(&err, "lock_hardware");
                Err(err)
            }
            Err(TryLockError::Poisoned(_)) => Err(CalibrationError::StatePoisoned),
        }
    }

    /// Apply `changes` to the loaded calibration; the caller holds the hardware
    fn reconfigure_current(
        &self,
        changes: CalibrationChanges,
    ) -> Result<Calibration, CalibrationError> {
        let current = self.manager.require_calibration()?;
        let fields = changes.fields();
        let updated = current
            .reconfigure(changes)
            .inspect_err(|err| self.report(err, "configure"))?;
        self.check_attached(&updated)
            .inspect_err(|err| self.report(err, "configure"))?;
        self.manager.replace(updated.clone())?;
        log::info!("[Configure] replaced {:?}", fields);
        Ok(updated)
    }

    /// Install a fresh calibration, enable it and save it as [`CURRENT`]
    fn adopt(&self, calibration: &Calibration) -> Result<(), CalibrationError> {
        self.manager.install(calibration.clone())?;
        self.store
            .save(calibration, CURRENT)
            .map(|_| ())
            .inspect_err(|err| self.report(err, "calibrate"))
    }

    /// Every corrector the calibration drives must be attached
    fn check_attached(&self, calibration: &Calibration) -> Result<(), CalibrationError> {
        match calibration
            .correctors()
            .iter()
            .find(|name| !self.corrector_names.contains(*name))
        {
            Some(missing) => Err(CalibrationError::UnknownCorrector {
                name: missing.clone(),
            }),
            None => Ok(()),
        }
    }

    fn report(&self, err: &CalibrationError, context: &str) {
        log_calibration_error(err, context);
        telemetry::hub().record_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::testing::{SimBench, SimHandles};

    fn axis() -> (DelayMacro, SimHandles, TempDir) {
        bench_axis(
            SimBench::new(0.1, 0.05)
                .corrector("tilt", 0.0, -0.5, 0.0)
                .corrector("lateral", 2.0, 0.0, 0.25),
        )
    }

    fn bench_axis(bench: SimBench) -> (DelayMacro, SimHandles, TempDir) {
        let (hardware, handles) = bench.build();
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::new(dir.path());
        (
            DelayMacro::with_store(hardware, EngineConfig::default(), store),
            handles,
            dir,
        )
    }

    #[test]
    fn test_uncalibrated_move_only_moves_axis() {
        let (delay, handles, _dir) = axis();
        delay.move_to(4.0).unwrap();
        assert_eq!(delay.position().unwrap(), 4.0);
        assert_eq!(handles.corrector_moves(0), 0);
        assert_eq!(handles.corrector_moves(1), 0);
    }

    #[test]
    fn test_calibrate_enables_and_saves_current() {
        let (delay, _handles, _dir) = axis();
        delay.calibrate(0.0, 10.0, 2.0, &["tilt", "lateral"], false).unwrap();

        assert!(delay.has_calibration().unwrap());
        assert!(delay.use_calibration().unwrap());
        assert!(delay.store().exists(CURRENT));
        assert_eq!(delay.last_scan().unwrap().len(), 6);
    }

    #[test]
    fn test_corrected_move_cancels_drift() {
        let (delay, handles, _dir) = axis();
        delay.calibrate(0.0, 10.0, 2.0, &["tilt", "lateral"], false).unwrap();

        delay.move_to(6.0).unwrap();
        // x drift 0.6 px is cancelled by tilt (-0.5 px/unit), y drift 0.3 px
        // by lateral (0.25 px/unit)
        assert!((handles.corrector_position(0) - 1.2).abs() < 1e-6);
        assert!((handles.corrector_position(1) - (2.0 - 1.2)).abs() < 1e-6);
    }

    #[test]
    fn test_disabled_calibration_moves_uncorrected() {
        let (delay, handles, _dir) = axis();
        delay.calibrate(0.0, 4.0, 2.0, &["tilt"], false).unwrap();
        delay.set_use_calibration(false).unwrap();
        let before = handles.corrector_moves(0);

        delay.move_to(3.0).unwrap();
        assert_eq!(handles.corrector_moves(0), before);
    }

    #[test]
    fn test_second_calibration_needs_confirmation() {
        let (delay, handles, _dir) = axis();
        delay.calibrate(0.0, 4.0, 2.0, &["tilt"], false).unwrap();
        let moves = handles.total_moves();

        let result = delay.calibrate(0.0, 4.0, 2.0, &["tilt"], false);
        assert!(matches!(result, Err(CalibrationError::CalibrationExists)));
        assert_eq!(handles.total_moves(), moves);

        assert!(delay.calibrate(0.0, 4.0, 2.0, &["tilt"], true).is_ok());
    }

    #[test]
    fn test_unknown_corrector_rejected_before_motion() {
        let (delay, handles, _dir) = axis();
        let result = delay.calibrate(0.0, 4.0, 2.0, &["nope"], false);
        assert!(matches!(result, Err(CalibrationError::UnknownCorrector { .. })));
        assert_eq!(handles.total_moves(), 0);
    }

    #[test]
    fn test_configure_without_calibration() {
        let (delay, _handles, _dir) = axis();
        let result = delay.configure(CalibrationChanges::new().scale(vec![1.0]));
        assert!(matches!(result, Err(CalibrationError::NoCalibration)));
    }

    #[test]
    fn test_configure_rejects_unattached_corrector() {
        let (delay, _handles, _dir) = axis();
        delay.calibrate(0.0, 4.0, 2.0, &["tilt"], false).unwrap();
        let result = delay.configure(CalibrationChanges::new().correctors(vec!["ghost".into()]));
        assert!(matches!(result, Err(CalibrationError::UnknownCorrector { .. })));
        assert_eq!(delay.calibration().unwrap().unwrap().correctors(), &["tilt"]);
    }

    #[test]
    fn test_view_requires_scan() {
        let (delay, _handles, _dir) = axis();
        assert!(matches!(delay.view_centroids(), Err(CalibrationError::NoScan)));
        delay.centroid_scan(0.0, 2.0, 1.0).unwrap();
        assert!(delay.view_centroids().unwrap().contains("centroid_x"));
        assert!(!delay.graph_centroids(20, 5).unwrap().is_empty());
    }

    #[test]
    fn test_mutation_during_rescale_is_rejected() {
        let (delay, handles, _dir) = bench_axis(
            SimBench::new(0.1, 0.0)
                .corrector("tilt", 0.0, -0.5, 0.0)
                .settle_time(Duration::from_millis(20)),
        );
        delay.calibrate(0.0, 4.0, 2.0, &["tilt"], false).unwrap();
        let moves = handles.corrector_moves(0);

        let rescaled = std::thread::scope(|scope| {
            let worker = scope.spawn(|| delay.rescale_calibration());
            while handles.corrector_moves(0) == moves && !worker.is_finished() {
                std::thread::yield_now();
            }
            assert!(matches!(
                delay.configure(CalibrationChanges::new().scale(vec![9.0])),
                Err(CalibrationError::AlreadyInProgress)
            ));
            assert!(matches!(
                delay.smooth_calibration(None, None),
                Err(CalibrationError::AlreadyInProgress)
            ));
            assert!(matches!(
                delay.load_calibration(CURRENT),
                Err(CalibrationError::AlreadyInProgress)
            ));
            worker.join().unwrap()
        })
        .unwrap();

        assert_eq!(delay.calibration().unwrap().unwrap(), rescaled);
        let updated = delay
            .configure(CalibrationChanges::new().scale(vec![9.0]))
            .unwrap();
        assert_eq!(updated.scale(), &[9.0]);
    }

    #[test]
    fn test_unrestored_calibration_is_still_installed() {
        // Five walk points plus the return to reference; the restore move jams
        let (delay, _handles, _dir) = bench_axis(
            SimBench::new(0.1, 0.0)
                .corrector("tilt", 0.0, -0.5, 0.0)
                .corrector_jams_after(0, 6),
        );
        let result = delay.calibrate(0.0, 10.0, 5.0, &["tilt"], false);

        assert!(matches!(result, Err(CalibrationError::Unrestored { .. })));
        assert!(delay.has_calibration().unwrap());
        assert!(delay.use_calibration().unwrap());
        assert!(delay.store().exists(CURRENT));
        assert!((delay.calibration().unwrap().unwrap().scale()[0] - 2.0).abs() < 1e-6);
    }
}
