//! Calibration persistence.
//!
//! Calibrations live as one JSON file each in a single directory. A bare
//! name maps to `<root>/<name>.json`; anything that looks like a path is used
//! as-is. The reserved name [`CURRENT`] holds the calibration produced by the
//! most recent successful run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::calibration::{Calibration, CorrectionTable, ScanRecord, ScanSample};
use crate::config::StorageConfig;
use crate::error::CalibrationError;
use crate::telemetry::{self, CalibrationEvent};

/// Reserved name of the default calibration
pub const CURRENT: &str = "current";

/// Environment variable overriding the default directory
pub const DIRECTORY_ENV: &str = "DELAY_DRIFT_CALIBRATION_DIR";

const EXTENSION: &str = "json";

static DEFAULT_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os(DIRECTORY_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/calibrations")))
});

/// On-disk layout of one calibration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationFile {
    /// Table rows in scan order
    pub calib: Vec<Vec<f64>>,
    /// Row keys
    pub targets: Vec<f64>,
    /// Corrector names, one per column
    pub motors: Vec<String>,
    /// `[target, measured_x, measured_y]` per scan stop
    pub scan: Vec<[f64; 3]>,
    pub scale: Vec<f64>,
    pub start: Vec<f64>,
}

impl From<&Calibration> for CalibrationFile {
    fn from(calibration: &Calibration) -> Self {
        let table = calibration.correction_table();
        Self {
            calib: table.rows().to_vec(),
            targets: table.targets().to_vec(),
            motors: calibration.correctors().to_vec(),
            scan: calibration
                .scan_record()
                .samples()
                .iter()
                .map(|s| [s.target, s.measured_x, s.measured_y])
                .collect(),
            scale: calibration.scale().to_vec(),
            start: calibration.reference_start().to_vec(),
        }
    }
}

impl CalibrationFile {
    /// Rebuild a validated calibration
    pub fn into_calibration(self) -> Result<Calibration, CalibrationError> {
        let table = CorrectionTable::with_columns(self.motors.len(), self.targets, self.calib)?;
        let scan = ScanRecord::from_samples(
            self.scan
                .into_iter()
                .map(|[target, x, y]| ScanSample::new(target, x, y))
                .collect(),
        )?;
        Calibration::new(table, self.motors, scan, self.scale, self.start)
    }
}

/// Directory-backed store of named calibrations
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    root: PathBuf,
}

impl CalibrationStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Store at the fixed install location (or `DELAY_DRIFT_CALIBRATION_DIR`)
    pub fn default_location() -> Self {
        Self::new(DEFAULT_ROOT.clone())
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        match &config.directory {
            Some(directory) => Self::new(directory.clone()),
            None => Self::default_location(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a name or path to the file it refers to
    ///
    /// Absolute paths, multi-component paths and anything ending in `.json`
    /// are taken literally.
    pub fn resolve(&self, name_or_path: &str) -> Result<PathBuf, CalibrationError> {
        let trimmed = name_or_path.trim();
        if trimmed.is_empty() {
            return Err(CalibrationError::invariant("calibration name is empty"));
        }
        let candidate = Path::new(trimmed);
        let literal = candidate.is_absolute()
            || candidate.components().count() > 1
            || candidate.extension().and_then(|e| e.to_str()) == Some(EXTENSION);
        if literal {
            Ok(candidate.to_path_buf())
        } else {
            Ok(self.root.join(format!("{}.{}", trimmed, EXTENSION)))
        }
    }

    pub fn exists(&self, name_or_path: &str) -> bool {
        self.resolve(name_or_path)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Write `calibration` under `name_or_path`, replacing any existing file
    pub fn save(
        &self,
        calibration: &Calibration,
        name_or_path: &str,
    ) -> Result<PathBuf, CalibrationError> {
        let path = self.resolve(name_or_path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }

        let json = serde_json::to_string_pretty(&CalibrationFile::from(calibration))
            .map_err(|err| CalibrationError::Io {
                path: path.clone(),
                details: err.to_string(),
            })?;
        // Write beside the target and rename so readers never see half a file
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json).map_err(|err| io_error(&staging, err))?;
        fs::rename(&staging, &path).map_err(|err| io_error(&path, err))?;

        log::info!("[Store] saved calibration to {}", path.display());
        telemetry::hub().publish(CalibrationEvent::Saved {
            path: path.display().to_string(),
        });
        Ok(path)
    }

    /// Read and validate the calibration stored under `name_or_path`
    ///
    /// # Errors
    /// - `CalibrationNotFound` when no file exists
    /// - `CalibrationFormat` when the JSON is malformed, misses a key or
    ///   breaks a structural invariant
    pub fn load(&self, name_or_path: &str) -> Result<Calibration, CalibrationError> {
        let path = self.resolve(name_or_path)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CalibrationError::CalibrationNotFound { path });
            }
            Err(err) => return Err(io_error(&path, err)),
        };

        let format_error = |reason: String| CalibrationError::CalibrationFormat {
            path: path.clone(),
            reason,
        };
        let file: CalibrationFile =
            serde_json::from_str(&contents).map_err(|err| format_error(err.to_string()))?;
        let calibration = file.into_calibration().map_err(|err| match err {
            CalibrationError::InvariantViolation { reason } => format_error(reason),
            other => other,
        })?;

        log::info!("[Store] loaded calibration from {}", path.display());
        telemetry::hub().publish(CalibrationEvent::Loaded {
            path: path.display().to_string(),
        });
        Ok(calibration)
    }

    /// Names of the calibrations saved in the store directory, sorted
    pub fn list(&self) -> Result<Vec<String>, CalibrationError> {
        let mut names = Vec::new();
        if !self.root.exists() {
            return Ok(names);
        }

        let entries = fs::read_dir(&self.root).map_err(|err| io_error(&self.root, err))?;
        for entry in entries {
            let path = entry.map_err(|err| io_error(&self.root, err))?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::default_location()
    }
}

fn io_error(path: &Path, err: io::Error) -> CalibrationError {
    CalibrationError::Io {
        path: path.to_path_buf(),
        details: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn calibration() -> Calibration {
        let scan = ScanRecord::from_samples(vec![
            ScanSample::new(0.0, 1.0, 2.0),
            ScanSample::new(5.0, 1.5, 2.5),
        ])
        .unwrap();
        let table =
            CorrectionTable::from_rows(vec![0.0, 5.0], vec![vec![0.0], vec![1.0]]).unwrap();
        Calibration::new(table, vec!["tilt".to_string()], scan, vec![2.0], vec![0.25]).unwrap()
    }

    #[test]
    fn test_resolve_names_and_paths() {
        let store = CalibrationStore::new("/data/cal");
        assert_eq!(store.resolve("current").unwrap(), PathBuf::from("/data/cal/current.json"));
        assert_eq!(store.resolve("other.json").unwrap(), PathBuf::from("other.json"));
        assert_eq!(store.resolve("sub/x").unwrap(), PathBuf::from("sub/x"));
        assert_eq!(store.resolve("/abs/y.json").unwrap(), PathBuf::from("/abs/y.json"));
        assert!(store.resolve("  ").is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::new(dir.path().join("calibrations"));
        let original = calibration();
        let path = store.save(&original, "x").unwrap();
        assert!(path.ends_with("x.json"));
        assert!(store.exists("x"));
        assert_eq!(store.load("x").unwrap(), original);
        assert_eq!(store.list().unwrap(), vec!["x".to_string()]);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::new(dir.path().join("calibrations"));
        assert!(matches!(
            store.load(CURRENT),
            Err(CalibrationError::CalibrationNotFound { .. })
        ));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_missing_key_is_format_error() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(
            root.join("bad.json"),
            r#"{"calib": [[0.0]], "targets": [0.0], "motors": ["tilt"], "scale": [1.0], "start": [0.0]}"#,
        )
        .unwrap();
        let store = CalibrationStore::new(root);
        assert!(matches!(
            store.load("bad"),
            Err(CalibrationError::CalibrationFormat { .. })
        ));
    }

    #[test]
    fn test_column_mismatch_is_format_error() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(
            root.join("wide.json"),
            r#"{"calib": [[0.0, 1.0]], "targets": [0.0], "motors": ["tilt"],
                "scan": [[0.0, 1.0, 1.0]], "scale": [1.0], "start": [0.0]}"#,
        )
        .unwrap();
        let store = CalibrationStore::new(root);
        match store.load("wide") {
            Err(CalibrationError::CalibrationFormat { reason, .. }) => {
                assert!(reason.contains("cells") || reason.contains("columns"), "{}", reason)
            }
            other => panic!("Expected CalibrationFormat, got {:?}", other),
        }
    }

    #[test]
    fn test_file_layout_uses_expected_keys() {
        let json = serde_json::to_value(CalibrationFile::from(&calibration())).unwrap();
        for key in ["calib", "targets", "motors", "scan", "scale", "start"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["scan"][1], serde_json::json!([5.0, 1.5, 2.5]));
    }
}
