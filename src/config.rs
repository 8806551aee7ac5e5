//! Configuration management for the drift engine
//!
//! This module provides runtime configuration loading from JSON files so
//! motion budgets, walk geometry and smoothing parameters can be tuned on
//! the beamline without recompilation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub walk: WalkConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Motor settling budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Extra attempts allowed when a move fails to settle
    pub settle_retries: usize,
    /// Upper bound on a single blocking move
    pub settle_timeout_ms: u64,
}

impl MotionConfig {
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            settle_retries: 3,
            settle_timeout_ms: 5_000,
        }
    }
}

/// Corrector walk geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkConfig {
    /// Half-width of the sweep around the reference start (corrector units)
    pub half_width: f64,
    /// Number of sweep points, endpoints included
    pub points: usize,
    /// Minimum |pixels per corrector unit| accepted from the fit
    pub min_sensitivity: f64,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            half_width: 0.01,
            points: 5,
            min_sensitivity: 1e-6,
        }
    }
}

/// Drift scan limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Largest number of targets a single scan may visit
    pub max_points: usize,
    /// Probe samples averaged at every stop
    pub average: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_points: 10_000,
            average: 1,
        }
    }
}

/// Savitzky-Golay post-processing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmoothingConfig {
    /// Filter window, odd and larger than `polyorder`
    pub window_length: usize,
    /// Order of the fitted polynomial
    pub polyorder: usize,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            window_length: 9,
            polyorder: 3,
        }
    }
}

/// Calibration storage location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Overrides the fixed calibration directory when set
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl EngineConfig {
    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON config file
    ///
    /// # Returns
    /// The loaded configuration, or the defaults if the file is missing or
    /// its JSON is invalid
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }
}
