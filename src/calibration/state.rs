// Calibration - the persisted drift-correction bundle
//
// A Calibration ties together the correction table, the correctors it
// drives, the scan it was derived from, the per-corrector scale and the
// corrector positions captured when it was built. It is immutable: changes
// go through `reconfigure`, which validates a modified copy and leaves the
// original untouched.

use std::collections::HashSet;

use crate::calibration::{CorrectionTable, ScanRecord};
use crate::error::CalibrationError;

/// Per-axis calibration switches (not persisted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct CalibrationFlags {
    /// A structurally valid calibration is loaded
    pub has_calibration: bool,
    /// Corrections are applied on every move
    pub use_calibration: bool,
}

impl CalibrationFlags {
    /// Corrections apply only when a calibration is loaded and enabled
    pub fn is_active(&self) -> bool {
        self.has_calibration && self.use_calibration
    }
}

/// Drift-correction bundle for one logical axis
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    correction_table: CorrectionTable,
    correctors: Vec<String>,
    scan_record: ScanRecord,
    /// Corrector units needed to cancel one pixel of drift
    scale: Vec<f64>,
    reference_start: Vec<f64>,
}

impl Calibration {
    /// Assemble a calibration, enforcing the structural invariants
    ///
    /// # Errors
    /// `InvariantViolation` when any of the following fail:
    /// - at least one corrector, no duplicate names
    /// - `scale`, `reference_start` and table columns match the corrector count
    /// - table rows match the scan record, key for key
    /// - scale and reference values are finite
    pub fn new(
        correction_table: CorrectionTable,
        correctors: Vec<String>,
        scan_record: ScanRecord,
        scale: Vec<f64>,
        reference_start: Vec<f64>,
    ) -> Result<Self, CalibrationError> {
        let calibration = Self {
            correction_table,
            correctors,
            scan_record,
            scale,
            reference_start,
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Check every structural invariant
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let count = self.correctors.len();
        if count == 0 {
            return Err(CalibrationError::invariant("calibration has no correctors"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.correctors.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(CalibrationError::invariant(format!(
                "corrector '{}' listed twice",
                dup
            )));
        }
        if self.scale.len() != count {
            return Err(CalibrationError::invariant(format!(
                "{} scale factors for {} correctors",
                self.scale.len(),
                count
            )));
        }
        if self.reference_start.len() != count {
            return Err(CalibrationError::invariant(format!(
                "{} reference positions for {} correctors",
                self.reference_start.len(),
                count
            )));
        }
        if self.correction_table.column_count() != count {
            return Err(CalibrationError::invariant(format!(
                "table has {} columns for {} correctors",
                self.correction_table.column_count(),
                count
            )));
        }
        if self.correction_table.is_empty() {
            return Err(CalibrationError::invariant("correction table is empty"));
        }
        if self.correction_table.row_count() != self.scan_record.len() {
            return Err(CalibrationError::invariant(format!(
                "table has {} rows for {} scan samples",
                self.correction_table.row_count(),
                self.scan_record.len()
            )));
        }
        let keys_match = self
            .correction_table
            .targets()
            .iter()
            .zip(self.scan_record.samples())
            .all(|(&key, sample)| key == sample.target);
        if !keys_match {
            return Err(CalibrationError::invariant(
                "table keys do not match scan targets",
            ));
        }
        if self
            .scale
            .iter()
            .chain(&self.reference_start)
            .any(|v| !v.is_finite())
        {
            return Err(CalibrationError::invariant(
                "scale and reference positions must be finite",
            ));
        }
        Ok(())
    }

    pub fn correction_table(&self) -> &CorrectionTable {
        &self.correction_table
    }

    pub fn correctors(&self) -> &[String] {
        &self.correctors
    }

    pub fn scan_record(&self) -> &ScanRecord {
        &self.scan_record
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    pub fn reference_start(&self) -> &[f64] {
        &self.reference_start
    }

    /// Calibrated target window as (low, high)
    pub fn target_range(&self) -> (f64, f64) {
        let targets = self.correction_table.targets();
        let first = targets.first().copied().unwrap_or(0.0);
        let last = targets.last().copied().unwrap_or(first);
        (first.min(last), first.max(last))
    }

    /// Copy with the requested fields replaced
    ///
    /// # Errors
    /// `InvariantViolation` when `changes` is empty or the modified copy breaks
    /// a structural invariant. The original is never modified.
    pub fn reconfigure(&self, changes: CalibrationChanges) -> Result<Calibration, CalibrationError> {
        if changes.is_empty() {
            return Err(CalibrationError::invariant(
                "reconfiguration must name at least one field",
            ));
        }
        let CalibrationChanges {
            correction_table,
            correctors,
            scan_record,
            scale,
            reference_start,
        } = changes;

        Calibration::new(
            correction_table.unwrap_or_else(|| self.correction_table.clone()),
            correctors.unwrap_or_else(|| self.correctors.clone()),
            scan_record.unwrap_or_else(|| self.scan_record.clone()),
            scale.unwrap_or_else(|| self.scale.clone()),
            reference_start.unwrap_or_else(|| self.reference_start.clone()),
        )
    }

    /// Multi-line human-readable description
    pub fn summary(&self) -> String {
        let (low, high) = self.target_range();
        let mut out = format!(
            "Calibration: {} rows over [{}, {}]\n",
            self.correction_table.row_count(),
            low,
            high
        );
        for (i, name) in self.correctors.iter().enumerate() {
            out.push_str(&format!(
                "  {} ({}): scale={:.6e} start={}\n",
                name,
                if i == 0 { "x" } else { "y" },
                self.scale[i],
                self.reference_start[i]
            ));
        }
        if let Some((dx, dy)) = self.scan_record.drift_rate() {
            out.push_str(&format!(
                "  drift: x={:.6e} px/unit, y={:.6e} px/unit\n",
                dx, dy
            ));
        }
        out
    }
}

/// Replacement values for a reconfiguration; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct CalibrationChanges {
    pub correction_table: Option<CorrectionTable>,
    pub correctors: Option<Vec<String>>,
    pub scan_record: Option<ScanRecord>,
    pub scale: Option<Vec<f64>>,
    pub reference_start: Option<Vec<f64>>,
}

impl CalibrationChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correction_table(mut self, table: CorrectionTable) -> Self {
        self.correction_table = Some(table);
        self
    }

    pub fn correctors(mut self, correctors: Vec<String>) -> Self {
        self.correctors = Some(correctors);
        self
    }

    pub fn scan_record(mut self, record: ScanRecord) -> Self {
        self.scan_record = Some(record);
        self
    }

    pub fn scale(mut self, scale: Vec<f64>) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn reference_start(mut self, start: Vec<f64>) -> Self {
        self.reference_start = Some(start);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Names of the fields being replaced
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.correction_table.is_some() {
            fields.push("correction_table");
        }
        if self.correctors.is_some() {
            fields.push("correctors");
        }
        if self.scan_record.is_some() {
            fields.push("scan_record");
        }
        if self.scale.is_some() {
            fields.push("scale");
        }
        if self.reference_start.is_some() {
            fields.push("reference_start");
        }
        fields
    }
}
