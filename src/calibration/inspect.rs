//! Text renderings of a drift scan for the interactive shell.

use std::fmt::Write;

use crate::calibration::ScanRecord;

/// One line per scan stop: target, x and y centroid
pub fn render_centroid_table(record: &ScanRecord) -> String {
    let mut out = format!("{:>14} {:>14} {:>14}\n", "target", "centroid_x", "centroid_y");
    for sample in record.samples() {
        let _ = writeln!(
            out,
            "{:>14.6} {:>14.6} {:>14.6}",
            sample.target, sample.measured_x, sample.measured_y
        );
    }
    if let Some((dx, dy)) = record.drift_rate() {
        let _ = writeln!(out, "drift: x={:.6e} px/unit y={:.6e} px/unit", dx, dy);
    }
    out
}

/// Character plot of centroid x (`x`) and y (`y`) against target
///
/// Both series share the vertical scale; overlapping points print `*`.
pub fn render_centroid_chart(record: &ScanRecord, width: usize, height: usize) -> String {
    let samples = record.samples();
    if samples.is_empty() {
        return "no scan data\n".to_string();
    }
    let width = width.max(2);
    let height = height.max(2);

    let (t_lo, t_hi) = bounds(samples.iter().map(|s| s.target));
    let (v_lo, v_hi) = bounds(samples.iter().flat_map(|s| [s.measured_x, s.measured_y]));

    let scale = |value: f64, lo: f64, hi: f64, cells: usize| -> usize {
        if hi > lo {
            (((value - lo) / (hi - lo)) * (cells - 1) as f64).round() as usize
        } else {
            0
        }
    };

    let mut grid = vec![vec![' '; width]; height];
    for sample in samples {
        let col = scale(sample.target, t_lo, t_hi, width);
        for (value, mark) in [(sample.measured_x, 'x'), (sample.measured_y, 'y')] {
            let row = height - 1 - scale(value, v_lo, v_hi, height);
            let cell = &mut grid[row][col];
            *cell = if *cell == ' ' || *cell == mark { mark } else { '*' };
        }
    }

    let mut out = String::new();
    for (i, row) in grid.iter().enumerate() {
        let label = if i == 0 {
            format!("{:>10.3}", v_hi)
        } else if i == height - 1 {
            format!("{:>10.3}", v_lo)
        } else {
            " ".repeat(10)
        };
        let _ = writeln!(out, "{} |{}", label, row.iter().collect::<String>());
    }
    let _ = writeln!(out, "{} +{}", " ".repeat(10), "-".repeat(width));
    let _ = writeln!(
        out,
        "{} {:<w$}{:>8.3}",
        " ".repeat(10),
        format!("{:.3}", t_lo),
        t_hi,
        w = width.saturating_sub(8)
    );
    out
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}
