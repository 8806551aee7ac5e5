// CalibrationBuilder - calibration and rescale routines
//
// A calibration runs in four stages:
// 1. Capture the corrector reference positions and the axis start
// 2. Scan the logical axis, recording centroid drift
// 3. Walk each corrector to fit its sensitivity
// 4. Convert the drift into a table of corrector deltas
//
// Both routines run inside a restoration scope: whatever happens, the
// correctors go back to their captured positions and the axis to where it
// started.

use crate::calibration::scan::DriftScanner;
use crate::calibration::walk::CorrectorWalk;
use crate::calibration::{Calibration, CalibrationChanges, CorrectionTable, ScanRecord};
use crate::config::EngineConfig;
use crate::error::{log_calibration_error, CalibrationError, CalibrationStage};
use crate::hardware::{move_settled, CancelToken, Positioner, Rig};
use crate::telemetry::{self, CalibrationEvent};

/// Centroid axes available to correctors (x, y)
pub const MAX_CORRECTORS: usize = 2;

/// Positions captured before a routine touches any motor
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub axis: f64,
    pub correctors: Vec<f64>,
}

impl Snapshot {
    /// Read the current position of every device in `rig`
    pub fn capture(rig: &Rig<'_>) -> Result<Self, CalibrationError> {
        let read = |source| CalibrationError::motion(CalibrationStage::Capture, source);
        let axis = rig.axis.position().map_err(read)?;
        let correctors = rig
            .correctors
            .iter()
            .map(|c| c.position().map_err(read))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { axis, correctors })
    }
}

/// Reject corrector sets the table layout cannot represent
pub fn check_corrector_count(count: usize) -> Result<(), CalibrationError> {
    if count == 0 || count > MAX_CORRECTORS {
        return Err(CalibrationError::invariant(format!(
            "between 1 and {} correctors required, got {}",
            MAX_CORRECTORS, count
        )));
    }
    Ok(())
}

/// Correction table for a scan: `delta[i] = (measured_i - measured_i[0]) * scale[i]`
///
/// Corrector 0 is driven by the x centroid and corrector 1 by y. Row keys are
/// the scan targets, so the first row is always all zeros.
pub fn build_table(record: &ScanRecord, scale: &[f64]) -> Result<CorrectionTable, CalibrationError> {
    check_corrector_count(scale.len())?;
    let first = record.first().ok_or(CalibrationError::NoScan)?;

    let mut table = CorrectionTable::new(scale.len());
    for sample in record.samples() {
        let deltas = scale
            .iter()
            .enumerate()
            .map(|(axis, s)| (sample.measured(axis) - first.measured(axis)) * s)
            .collect();
        table.push_row(sample.target, deltas)?;
    }
    Ok(table)
}

/// Runs calibration routines against a borrowed [`Rig`]
pub struct CalibrationBuilder<'a> {
    config: &'a EngineConfig,
    cancel: &'a CancelToken,
}

impl<'a> CalibrationBuilder<'a> {
    pub fn new(config: &'a EngineConfig, cancel: &'a CancelToken) -> Self {
        Self { config, cancel }
    }

    /// Build a new calibration over `start..=stop` by `step`
    ///
    /// `on_scan` sees the completed scan before the corrector walks begin.
    ///
    /// # Errors
    /// - `InvalidRange` / `InvariantViolation` before any motion
    /// - `ScanAborted`, `DegenerateFit`, `Cancelled` or `Motion` from the
    ///   routine itself; the rig is restored in every case
    /// - `Unrestored` carrying the finished calibration when the routine
    ///   succeeded but the rig could not be put back
    pub fn calibrate<F>(
        &self,
        rig: &mut Rig<'_>,
        start: f64,
        stop: f64,
        step: f64,
        mut on_scan: F,
    ) -> Result<Calibration, CalibrationError>
    where
        F: FnMut(&ScanRecord),
    {
        check_corrector_count(rig.correctors.len())?;
        crate::calibration::scan_targets(start, stop, step, self.config.scan.max_points)?;

        let names = rig.corrector_names();
        let snapshot = Snapshot::capture(rig)?;
        tracing::info!(
            "[Calibrate] {} over [{}, {}] step {} with correctors {:?} at {:?}",
            rig.axis.name(),
            start,
            stop,
            step,
            names,
            snapshot.correctors
        );

        self.with_restoration(rig, &snapshot, |rig| {
            let scanner = DriftScanner::new(&self.config.motion, &self.config.scan, self.cancel);
            let record = scanner.scan(&mut *rig.axis, &mut *rig.probe, start, stop, step)?;
            on_scan(&record);

            let scale = self.walk_all(rig, &record, &snapshot.correctors)?;
            self.cancel.check(CalibrationStage::Table)?;
            let table = build_table(&record, &scale)?;
            Calibration::new(table, names, record, scale, snapshot.correctors.clone())
        })
    }

    /// Re-walk the correctors of `calibration` and rebuild its table from the
    /// stored scan. Reference positions and the scan are kept.
    ///
    /// A restore failure after a successful walk yields `Unrestored` with the
    /// rescaled calibration.
    pub fn rescale(
        &self,
        rig: &mut Rig<'_>,
        calibration: &Calibration,
    ) -> Result<Calibration, CalibrationError> {
        if rig.corrector_names() != calibration.correctors() {
            return Err(CalibrationError::invariant(format!(
                "rig correctors {:?} do not match calibration {:?}",
                rig.corrector_names(),
                calibration.correctors()
            )));
        }

        let snapshot = Snapshot::capture(rig)?;
        tracing::info!(
            "[Rescale] {} correctors {:?} around {:?}",
            rig.axis.name(),
            calibration.correctors(),
            calibration.reference_start()
        );

        self.with_restoration(rig, &snapshot, |rig| {
            let record = calibration.scan_record();
            let scale = self.walk_all(rig, record, calibration.reference_start())?;
            let table = build_table(record, &scale)?;
            calibration.reconfigure(CalibrationChanges::new().scale(scale).correction_table(table))
        })
    }

    /// Hold the axis at the first scan target and walk every corrector
    fn walk_all(
        &self,
        rig: &mut Rig<'_>,
        record: &ScanRecord,
        references: &[f64],
    ) -> Result<Vec<f64>, CalibrationError> {
        let hold = record.first().ok_or(CalibrationError::NoScan)?.target;
        self.cancel.check(CalibrationStage::Walk)?;
        move_settled(&mut *rig.axis, hold, &self.config.motion)
            .map_err(|source| CalibrationError::motion(CalibrationStage::Walk, source))?;

        let walker = CorrectorWalk::new(
            &self.config.walk,
            &self.config.motion,
            self.config.scan.average,
            self.cancel,
        );
        let mut scale = Vec::with_capacity(rig.correctors.len());
        for (axis, corrector) in rig.correctors.iter_mut().enumerate() {
            let reference = references.get(axis).copied().ok_or_else(|| {
                CalibrationError::invariant(format!("no reference position for corrector {}", axis))
            })?;
            let result = walker.walk(&mut **corrector, &mut *rig.probe, axis, reference)?;
            scale.push(result.scale);
        }
        Ok(scale)
    }

    /// Run `routine`, then put the rig back where `snapshot` found it
    ///
    /// On failure motion is halted before restoring and the routine's error
    /// wins over any restore error. A finished calibration is never dropped
    /// because of a restore failure.
    fn with_restoration<'r, F>(
        &self,
        rig: &mut Rig<'r>,
        snapshot: &Snapshot,
        routine: F,
    ) -> Result<Calibration, CalibrationError>
    where
        F: FnOnce(&mut Rig<'r>) -> Result<Calibration, CalibrationError>,
    {
        let outcome = routine(rig);
        if let Err(err) = &outcome {
            log_calibration_error(err, "calibration routine");
            stop_all(rig);
        }

        let restored = self.restore(rig, snapshot);
        match outcome {
            Ok(calibration) => match restored {
                Ok(()) => Ok(calibration),
                Err(CalibrationError::Motion { source, .. }) => {
                    log::error!("[Restore] calibration finished but rig not restored: {}", source);
                    Err(CalibrationError::Unrestored {
                        calibration: Box::new(calibration),
                        source,
                    })
                }
                Err(other) => Err(other),
            },
            Err(err) => {
                if let Err(restore_err) = restored {
                    log::error!("[Restore] incomplete after failed routine: {}", restore_err);
                }
                Err(err)
            }
        }
    }

    /// Move every device back to its captured position
    ///
    /// All devices are attempted even after a failure; the first failure is
    /// returned. Cancellation is deliberately not checked here.
    pub fn restore(&self, rig: &mut Rig<'_>, snapshot: &Snapshot) -> Result<(), CalibrationError> {
        let mut first_failure = None;
        for (corrector, &position) in rig.correctors.iter_mut().zip(&snapshot.correctors) {
            if let Err(err) = self.restore_one(&mut **corrector, position) {
                first_failure.get_or_insert(err);
            }
        }
        if let Err(err) = self.restore_one(&mut *rig.axis, snapshot.axis) {
            first_failure.get_or_insert(err);
        }
        first_failure.map_or(Ok(()), Err)
    }

    fn restore_one<M: Positioner + ?Sized>(
        &self,
        motor: &mut M,
        position: f64,
    ) -> Result<(), CalibrationError> {
        let name = motor.name().to_string();
        match move_settled(motor, position, &self.config.motion) {
            Ok(()) => {
                log::debug!("[Restore] {} -> {}", name, position);
                telemetry::hub().publish(CalibrationEvent::Restored {
                    motor: name,
                    position,
                });
                Ok(())
            }
            Err(source) => {
                log::error!("[Restore] {} could not return to {}: {}", name, position, source);
                telemetry::hub().publish(CalibrationEvent::RestoreFailed {
                    motor: name,
                    position,
                    reason: source.to_string(),
                });
                Err(CalibrationError::motion(CalibrationStage::Restore, source))
            }
        }
    }
}

fn stop_all(rig: &mut Rig<'_>) {
    for corrector in rig.correctors.iter_mut() {
        if let Err(err) = corrector.stop() {
            log::warn!("[Restore] stop {} failed: {}", corrector.name(), err);
        }
    }
    if let Err(err) = rig.axis.stop() {
        log::warn!("[Restore] stop {} failed: {}", rig.axis.name(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::ScanSample;
    use crate::testing::SimBench;

    fn record() -> ScanRecord {
        ScanRecord::from_samples(vec![
            ScanSample::new(0.0, 10.0, 20.0),
            ScanSample::new(5.0, 10.5, 19.0),
            ScanSample::new(10.0, 11.0, 18.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_build_table_uses_first_sample_as_origin() {
        let table = build_table(&record(), &[2.0, 0.5]).unwrap();
        assert_eq!(table.targets(), &[0.0, 5.0, 10.0]);
        assert_eq!(table.row(0).unwrap(), &[0.0, 0.0]);
        assert_eq!(table.row(1).unwrap(), &[1.0, -0.5]);
        assert_eq!(table.row(2).unwrap(), &[2.0, -1.0]);
    }

    #[test]
    fn test_build_table_rejects_three_correctors() {
        assert!(matches!(
            build_table(&record(), &[1.0, 1.0, 1.0]),
            Err(CalibrationError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_calibrate_single_corrector() {
        let (mut hw, handles) = SimBench::new(0.1, 0.0)
            .axis_start(3.0)
            .corrector("tilt", 0.0, -0.5, 0.0)
            .build();
        let config = EngineConfig::default();
        let cancel = CancelToken::new();
        let builder = CalibrationBuilder::new(&config, &cancel);
        let mut scans = 0;

        let mut rig = hw.select(&["tilt"]).unwrap();
        let cal = builder
            .calibrate(&mut rig, 0.0, 10.0, 5.0, |_| scans += 1)
            .unwrap();

        assert_eq!(scans, 1);
        assert!((cal.scale()[0] - 2.0).abs() < 1e-6);
        assert_eq!(cal.reference_start(), &[0.0]);
        let deltas = cal.correction_table().column(0).unwrap();
        assert!((deltas[1] - 1.0).abs() < 1e-6);
        assert!((deltas[2] - 2.0).abs() < 1e-6);
        assert_eq!(handles.corrector_position(0), 0.0);
        assert_eq!(handles.axis_position(), 3.0);
    }

    #[test]
    fn test_invalid_range_moves_nothing() {
        let (mut hw, handles) = SimBench::new(0.1, 0.0)
            .corrector("tilt", 0.0, -0.5, 0.0)
            .build();
        let config = EngineConfig::default();
        let cancel = CancelToken::new();
        let builder = CalibrationBuilder::new(&config, &cancel);

        let mut rig = hw.select(&["tilt"]).unwrap();
        let result = builder.calibrate(&mut rig, 0.0, 10.0, -1.0, |_| {});
        assert!(matches!(result, Err(CalibrationError::InvalidRange { .. })));
        assert_eq!(handles.axis_moves(), 0);
        assert_eq!(handles.corrector_moves(0), 0);
    }

    #[test]
    fn test_failed_walk_restores_rig() {
        let (mut hw, handles) = SimBench::new(0.1, 0.0)
            .axis_start(4.0)
            .corrector("tilt", 1.5, -0.5, 0.0)
            .corrector_fails_after(0, 2)
            .build();
        let config = EngineConfig::default();
        let cancel = CancelToken::new();
        let builder = CalibrationBuilder::new(&config, &cancel);

        let mut rig = hw.select(&["tilt"]).unwrap();
        let result = builder.calibrate(&mut rig, 0.0, 10.0, 5.0, |_| {});

        assert!(matches!(
            result,
            Err(CalibrationError::Motion {
                stage: CalibrationStage::Walk,
                ..
            })
        ));
        assert_eq!(handles.corrector_position(0), 1.5);
        assert_eq!(handles.axis_position(), 4.0);
    }

    #[test]
    fn test_restore_failure_does_not_mask_routine_error() {
        let (mut hw, handles) = SimBench::new(0.1, 0.0)
            .axis_start(4.0)
            .corrector("tilt", 1.5, -0.5, 0.0)
            .corrector_jams_after(0, 1)
            .build();
        let config = EngineConfig::default();
        let cancel = CancelToken::new();
        let builder = CalibrationBuilder::new(&config, &cancel);

        let mut rig = hw.select(&["tilt"]).unwrap();
        let result = builder.calibrate(&mut rig, 0.0, 10.0, 5.0, |_| {});

        assert!(matches!(
            result,
            Err(CalibrationError::Motion {
                stage: CalibrationStage::Walk,
                ..
            })
        ));
        // The axis is still restored even though the corrector is jammed
        assert_eq!(handles.axis_position(), 4.0);
    }

    #[test]
    fn test_cancelled_routine_still_restores() {
        let (mut hw, handles) = SimBench::new(0.1, 0.0)
            .axis_start(2.0)
            .corrector("tilt", 0.0, -0.5, 0.0)
            .build();
        let config = EngineConfig::default();
        let cancel = CancelToken::new();
        let builder = CalibrationBuilder::new(&config, &cancel);

        let mut rig = hw.select(&["tilt"]).unwrap();
        let result = builder.calibrate(&mut rig, 0.0, 10.0, 5.0, |_| cancel.cancel());

        assert!(matches!(
            result,
            Err(CalibrationError::Cancelled {
                stage: CalibrationStage::Walk
            })
        ));
        assert_eq!(handles.axis_position(), 2.0);
        assert_eq!(handles.corrector_position(0), 0.0);
    }

    #[test]
    fn test_cancel_during_scan_stops_and_restores() {
        let cancel = CancelToken::new();
        let (mut hw, handles) = SimBench::new(0.1, 0.0)
            .axis_start(2.0)
            .corrector("tilt", 0.5, -0.5, 0.0)
            .corrector("lateral", 1.0, 0.0, 0.25)
            .cancel_after_samples(cancel.clone(), 2)
            .build();
        let config = EngineConfig::default();
        let builder = CalibrationBuilder::new(&config, &cancel);

        let mut rig = hw.select(&["tilt", "lateral"]).unwrap();
        let result = builder.calibrate(&mut rig, 0.0, 10.0, 1.0, |_| {
            panic!("scan should not complete")
        });

        assert!(matches!(
            result,
            Err(CalibrationError::Cancelled {
                stage: CalibrationStage::Scan
            })
        ));
        assert_eq!(handles.axis_stops(), 1);
        assert_eq!(handles.corrector_stops(0), 1);
        assert_eq!(handles.corrector_stops(1), 1);
        assert_eq!(handles.axis_position(), 2.0);
        assert_eq!(handles.corrector_position(0), 0.5);
        assert_eq!(handles.corrector_position(1), 1.0);
    }

    #[test]
    fn test_successful_calibration_never_stops_motors() {
        let (mut hw, handles) = SimBench::new(0.1, 0.0)
            .corrector("tilt", 0.0, -0.5, 0.0)
            .build();
        let config = EngineConfig::default();
        let cancel = CancelToken::new();
        let builder = CalibrationBuilder::new(&config, &cancel);

        let mut rig = hw.select(&["tilt"]).unwrap();
        builder.calibrate(&mut rig, 0.0, 10.0, 5.0, |_| {}).unwrap();
        assert_eq!(handles.axis_stops(), 0);
        assert_eq!(handles.corrector_stops(0), 0);
    }

    #[test]
    fn test_restore_failure_after_success_keeps_calibration() {
        // Five walk points plus the return to reference; the restore move jams
        let (mut hw, handles) = SimBench::new(0.1, 0.0)
            .axis_start(3.0)
            .corrector("tilt", 0.0, -0.5, 0.0)
            .corrector_jams_after(0, 6)
            .build();
        let config = EngineConfig::default();
        let cancel = CancelToken::new();
        let builder = CalibrationBuilder::new(&config, &cancel);

        let mut rig = hw.select(&["tilt"]).unwrap();
        let result = builder.calibrate(&mut rig, 0.0, 10.0, 5.0, |_| {});

        match result {
            Err(CalibrationError::Unrestored {
                calibration,
                source,
            }) => {
                assert!((calibration.scale()[0] - 2.0).abs() < 1e-6);
                assert!(matches!(source, crate::error::MotionError::Fault { .. }));
            }
            other => panic!("expected Unrestored, got {:?}", other),
        }
        assert_eq!(handles.corrector_moves(0), 7);
        assert_eq!(handles.axis_position(), 3.0);
    }

    #[test]
    fn test_rescale_keeps_reference_and_scan() {
        let (mut hw, handles) = SimBench::new(0.1, 0.2)
            .corrector("tilt", 0.0, -0.5, 0.0)
            .corrector("lateral", 1.0, 0.0, 0.25)
            .build();
        let config = EngineConfig::default();
        let cancel = CancelToken::new();
        let builder = CalibrationBuilder::new(&config, &cancel);

        let mut rig = hw.select(&["tilt", "lateral"]).unwrap();
        let cal = builder.calibrate(&mut rig, 0.0, 10.0, 2.0, |_| {}).unwrap();
        let rescaled = builder.rescale(&mut rig, &cal).unwrap();

        assert_eq!(rescaled.reference_start(), cal.reference_start());
        assert_eq!(rescaled.scan_record(), cal.scan_record());
        for (a, b) in rescaled.scale().iter().zip(cal.scale()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert!((cal.scale()[1] + 4.0).abs() < 1e-6);
        assert_eq!(handles.corrector_position(1), 1.0);
    }

    #[test]
    fn test_rescale_rejects_mismatched_rig() {
        let (mut hw, _handles) = SimBench::new(0.1, 0.2)
            .corrector("tilt", 0.0, -0.5, 0.0)
            .corrector("lateral", 1.0, 0.0, 0.25)
            .build();
        let config = EngineConfig::default();
        let cancel = CancelToken::new();
        let builder = CalibrationBuilder::new(&config, &cancel);

        let cal = {
            let mut rig = hw.select(&["tilt"]).unwrap();
            builder.calibrate(&mut rig, 0.0, 4.0, 2.0, |_| {}).unwrap()
        };
        let mut rig = hw.select(&["lateral"]).unwrap();
        assert!(builder.rescale(&mut rig, &cal).is_err());
    }
}
