// CorrectionTable - per-target corrector setpoint deltas
//
// Rows are keyed by logical-axis target in scan order. Each row holds one
// delta per corrector, indexed by the corrector's position in the
// calibration; columns carry no names at this layer.

use crate::error::CalibrationError;

/// Table of corrector deltas keyed by scan target
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionTable {
    targets: Vec<f64>,
    rows: Vec<Vec<f64>>,
    columns: usize,
}

impl CorrectionTable {
    /// Empty table with a fixed column count
    pub fn new(columns: usize) -> Self {
        Self {
            targets: Vec::new(),
            rows: Vec::new(),
            columns,
        }
    }

    /// Build a table from keys and rows
    ///
    /// # Errors
    /// `InvariantViolation` when key and row counts differ, a row has the
    /// wrong width, or any cell is not finite.
    pub fn from_rows(targets: Vec<f64>, rows: Vec<Vec<f64>>) -> Result<Self, CalibrationError> {
        let columns = rows.first().map(Vec::len).unwrap_or(0);
        Self::with_columns(columns, targets, rows)
    }

    /// Build a table whose rows must all have `columns` cells
    pub fn with_columns(
        columns: usize,
        targets: Vec<f64>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self, CalibrationError> {
        if targets.len() != rows.len() {
            return Err(CalibrationError::invariant(format!(
                "table has {} keys but {} rows",
                targets.len(),
                rows.len()
            )));
        }
        let mut table = Self::new(columns);
        for (target, row) in targets.into_iter().zip(rows) {
            table.push_row(target, row)?;
        }
        Ok(table)
    }

    /// Append a row at the end of the table
    pub fn push_row(&mut self, target: f64, deltas: Vec<f64>) -> Result<(), CalibrationError> {
        if deltas.len() != self.columns {
            return Err(CalibrationError::invariant(format!(
                "row for target {} has {} cells, table has {} columns",
                target,
                deltas.len(),
                self.columns
            )));
        }
        if !target.is_finite() || deltas.iter().any(|d| !d.is_finite()) {
            return Err(CalibrationError::invariant(format!(
                "row for target {} is not finite",
                target
            )));
        }
        self.targets.push(target);
        self.rows.push(deltas);
        Ok(())
    }

    pub fn targets(&self) -> &[f64] {
        &self.targets
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn column_count(&self) -> usize {
        self.columns
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row index whose key equals `target` exactly
    pub fn position_of(&self, target: f64) -> Option<usize> {
        self.targets.iter().position(|&t| t == target)
    }

    /// Values of one column, in row order
    pub fn column(&self, index: usize) -> Option<Vec<f64>> {
        if index >= self.columns {
            return None;
        }
        Some(self.rows.iter().map(|row| row[index]).collect())
    }

    /// Copy of the table with one column replaced
    pub fn with_column(&self, index: usize, values: &[f64]) -> Result<Self, CalibrationError> {
        if index >= self.columns || values.len() != self.rows.len() {
            return Err(CalibrationError::invariant(format!(
                "replacement column {} has {} values for {} rows",
                index,
                values.len(),
                self.rows.len()
            )));
        }
        let mut table = self.clone();
        for (row, &value) in table.rows.iter_mut().zip(values) {
            row[index] = value;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows() {
        let table =
            CorrectionTable::from_rows(vec![0.0, 1.0], vec![vec![0.0, 0.0], vec![0.5, -0.5]])
                .unwrap();
        assert_eq!(table.column_count(), 2);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.row(1), Some(&[0.5, -0.5][..]));
        assert_eq!(table.column(1), Some(vec![0.0, -0.5]));
        assert_eq!(table.position_of(1.0), Some(1));
        assert_eq!(table.position_of(0.5), None);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let result =
            CorrectionTable::from_rows(vec![0.0, 1.0], vec![vec![0.0, 0.0], vec![0.5]]);
        assert!(matches!(
            result,
            Err(CalibrationError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_key_count_mismatch_rejected() {
        assert!(CorrectionTable::from_rows(vec![0.0], vec![vec![0.0], vec![1.0]]).is_err());
    }

    #[test]
    fn test_with_column() {
        let table = CorrectionTable::from_rows(vec![0.0, 1.0], vec![vec![1.0], vec![2.0]]).unwrap();
        let replaced = table.with_column(0, &[3.0, 4.0]).unwrap();
        assert_eq!(replaced.column(0), Some(vec![3.0, 4.0]));
        assert_eq!(table.column(0), Some(vec![1.0, 2.0]));
        assert!(table.with_column(1, &[0.0, 0.0]).is_err());
    }
}
