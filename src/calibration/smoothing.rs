//! Savitzky-Golay smoothing of correction tables.
//!
//! Each output value is a degree-`polyorder` least-squares polynomial fitted
//! over `window` neighbouring rows and evaluated at the row itself. Rows near
//! either end reuse the first or last full window, so the output has the
//! same length as the input and no padding is invented.

use crate::calibration::fit::solve_linear_system;
use crate::calibration::CorrectionTable;
use crate::error::CalibrationError;

fn check_window(len: usize, window: usize, polyorder: usize) -> Result<(), CalibrationError> {
    if window % 2 == 0 {
        return Err(CalibrationError::invariant(format!(
            "smoothing window {} must be odd",
            window
        )));
    }
    if window <= polyorder {
        return Err(CalibrationError::invariant(format!(
            "smoothing window {} must exceed polyorder {}",
            window, polyorder
        )));
    }
    if window > len {
        return Err(CalibrationError::invariant(format!(
            "smoothing window {} exceeds {} rows",
            window, len
        )));
    }
    Ok(())
}

/// Smooth one series
///
/// # Errors
/// `InvariantViolation` when `window` is even, not larger than `polyorder`,
/// or longer than `values`.
pub fn savgol_filter(
    values: &[f64],
    window: usize,
    polyorder: usize,
) -> Result<Vec<f64>, CalibrationError> {
    check_window(values.len(), window, polyorder)?;
    let n = values.len();
    let half = window / 2;
    let terms = polyorder + 1;

    let mut smoothed = Vec::with_capacity(n);
    for i in 0..n {
        let first = i.saturating_sub(half).min(n - window);

        // Normal equations for the polynomial centred on row i
        let mut a = vec![vec![0.0; terms]; terms];
        let mut b = vec![0.0; terms];
        for (j, &y) in values.iter().enumerate().skip(first).take(window) {
            let x = j as f64 - i as f64;
            let powers: Vec<f64> = (0..2 * terms - 1).map(|p| x.powi(p as i32)).collect();
            for row in 0..terms {
                for col in 0..terms {
                    a[row][col] += powers[row + col];
                }
                b[row] += powers[row] * y;
            }
        }

        let coefficients = solve_linear_system(a, b).ok_or_else(|| {
            CalibrationError::invariant(format!("smoothing fit is singular at row {}", i))
        })?;
        smoothed.push(coefficients[0]);
    }
    Ok(smoothed)
}

/// Smooth every column of `table`, keeping its keys
pub fn smooth_table(
    table: &CorrectionTable,
    window: usize,
    polyorder: usize,
) -> Result<CorrectionTable, CalibrationError> {
    let mut smoothed = table.clone();
    for index in 0..table.column_count() {
        let column = table
            .column(index)
            .ok_or_else(|| CalibrationError::invariant(format!("no column {}", index)))?;
        smoothed = smoothed.with_column(index, &savgol_filter(&column, window, polyorder)?)?;
    }
    log::debug!(
        "[Smooth] {} columns x {} rows, window={} polyorder={}",
        table.column_count(),
        table.row_count(),
        window,
        polyorder
    );
    Ok(smoothed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-8, "{:?} vs {:?}", actual, expected);
        }
    }

    #[test]
    fn test_polynomial_of_lower_order_passes_through() {
        let values: Vec<f64> = (0..12).map(|i| 0.5 * (i * i) as f64 - i as f64 + 2.0).collect();
        assert_close(&savgol_filter(&values, 5, 2).unwrap(), &values);
    }

    #[test]
    fn test_constant_window_averages() {
        // polyorder 0 is a moving mean; edges reuse the end windows
        let smoothed = savgol_filter(&[0.0, 3.0, 0.0, 3.0, 0.0], 3, 0).unwrap();
        assert_close(&smoothed, &[1.0, 1.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_smoothing_reduces_alternating_noise() {
        let values: Vec<f64> = (0..15)
            .map(|i| i as f64 + if i % 2 == 0 { 0.2 } else { -0.2 })
            .collect();
        let smoothed = savgol_filter(&values, 9, 3).unwrap();
        let residual: f64 = smoothed
            .iter()
            .enumerate()
            .skip(4)
            .take(7)
            .map(|(i, v)| (v - i as f64).abs())
            .fold(0.0, f64::max);
        assert!(residual < 0.2, "residual {}", residual);
    }

    #[test]
    fn test_window_validation() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!(savgol_filter(&values, 4, 1).is_err());
        assert!(savgol_filter(&values, 3, 3).is_err());
        assert!(savgol_filter(&values, 7, 2).is_err());
        assert!(savgol_filter(&values, 5, 4).is_ok());
    }

    #[test]
    fn test_smooth_table_keeps_keys() {
        let targets: Vec<f64> = (0..7).map(|i| i as f64).collect();
        let rows = targets.iter().map(|&t| vec![2.0 * t, -t]).collect();
        let table = CorrectionTable::from_rows(targets.clone(), rows).unwrap();
        let smoothed = smooth_table(&table, 5, 1).unwrap();
        assert_eq!(smoothed.targets(), table.targets());
        assert_close(&smoothed.column(0).unwrap(), &table.column(0).unwrap());
        assert_close(&smoothed.column(1).unwrap(), &table.column(1).unwrap());
    }
}
