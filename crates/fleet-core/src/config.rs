//! TOML configuration files.
//!
//! Three files feed the fleet core:
//!
//! - the **workload file**: load level weights plus optional tier thresholds
//!   and reserve ratio, hot-reloaded while the balancer runs;
//! - the **controllers file**: per-metric band tables for feedback
//!   controllers;
//! - the daemon file `fleetd.toml`, which points at the other two.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::band::{BandTable, BandTriple};
use crate::error::{ConfigError, ConfigResult};
use crate::level::{Level, LEVELS_COUNT};

/// Default weight per level; busier levels get proportionally fewer rooms
/// and a saturated server gets none.
pub const DEFAULT_LOAD_LEVEL_WEIGHTS: [u32; LEVELS_COUNT] = [50, 40, 30, 25, 20, 15, 10, 5, 1, 0];

fn read_file(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

// ── Workload file ──────────────────────────────────────────────

/// On-disk shape of the workload file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadFile {
    pub weights: Vec<u32>,
    pub priority_up_threshold: Option<Level>,
    pub priority_down_threshold: Option<Level>,
    pub reserve_ratio: Option<f64>,
}

/// Validated balancer settings.
///
/// Published as a whole; readers always see one complete settings value.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSettings {
    /// Selection weight per level, indexed by `Level::index()`.
    pub weights: [u32; LEVELS_COUNT],
    /// Tier average at or above which reserve is released and the next tier admitted.
    pub priority_up_threshold: Level,
    /// Tier average below which reserve is restored and the top tier excluded.
    pub priority_down_threshold: Level,
    /// Fraction of each tier held back as reserve, in `[0, 1]`.
    pub reserve_ratio: f64,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            weights: DEFAULT_LOAD_LEVEL_WEIGHTS,
            priority_up_threshold: Level::Level7,
            priority_down_threshold: Level::Level4,
            reserve_ratio: 0.0,
        }
    }
}

impl WorkloadSettings {
    /// Weight configured for a level.
    pub fn weight(&self, level: Level) -> u32 {
        self.weights[level.index()]
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let file: WorkloadFile = toml::from_str(content)?;
        Self::try_from(file)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        Self::from_toml_str(&read_file(path)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(&WorkloadFile::from(self))?)
    }
}

impl TryFrom<WorkloadFile> for WorkloadSettings {
    type Error = ConfigError;

    fn try_from(file: WorkloadFile) -> ConfigResult<Self> {
        let found = file.weights.len();
        let weights: [u32; LEVELS_COUNT] =
            file.weights
                .try_into()
                .map_err(|_| ConfigError::WeightsLength {
                    expected: LEVELS_COUNT,
                    found,
                })?;

        let defaults = WorkloadSettings::default();
        let reserve_ratio = file.reserve_ratio.unwrap_or(defaults.reserve_ratio);
        if !(0.0..=1.0).contains(&reserve_ratio) {
            return Err(ConfigError::ReserveRatio(reserve_ratio));
        }

        let up = file
            .priority_up_threshold
            .unwrap_or(defaults.priority_up_threshold);
        let down = file
            .priority_down_threshold
            .unwrap_or(defaults.priority_down_threshold);
        if down > up {
            return Err(ConfigError::Thresholds { up, down });
        }

        Ok(Self {
            weights,
            priority_up_threshold: up,
            priority_down_threshold: down,
            reserve_ratio,
        })
    }
}

impl From<&WorkloadSettings> for WorkloadFile {
    fn from(settings: &WorkloadSettings) -> Self {
        Self {
            weights: settings.weights.to_vec(),
            priority_up_threshold: Some(settings.priority_up_threshold),
            priority_down_threshold: Some(settings.priority_down_threshold),
            reserve_ratio: Some(settings.reserve_ratio),
        }
    }
}

// ── Controllers file ───────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllersFile {
    #[serde(default)]
    pub controllers: BTreeMap<String, ControllerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerEntry {
    pub initial_level: Option<Level>,
    /// `[level, upper, lower]` rows.
    #[serde(default)]
    pub bands: Vec<BandTriple>,
}

/// Thresholds and starting level for one metric's controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerThresholds {
    pub initial_level: Level,
    pub table: BandTable,
}

/// Parse a controllers file into per-metric thresholds.
pub fn controller_thresholds_from_str(
    content: &str,
) -> ConfigResult<BTreeMap<String, ControllerThresholds>> {
    let file: ControllersFile = toml::from_str(content)?;
    file.controllers
        .into_iter()
        .map(|(metric, entry)| {
            let table = BandTable::from_triples(entry.bands)?;
            Ok((
                metric,
                ControllerThresholds {
                    initial_level: entry.initial_level.unwrap_or(Level::LOWEST),
                    table,
                },
            ))
        })
        .collect()
}

/// Load per-metric controller thresholds from a controllers file.
pub fn load_controller_thresholds(
    path: &Path,
) -> ConfigResult<BTreeMap<String, ControllerThresholds>> {
    controller_thresholds_from_str(&read_file(path)?)
}

// ── Daemon file ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub workload_file: PathBuf,
    pub controllers_file: Option<PathBuf>,
    /// How often the workload file is polled when file events are missed.
    #[serde(default = "default_watch_interval")]
    pub watch_interval: String,
    pub calibration: Option<CalibrationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub state_file: PathBuf,
    /// Adaptation factor; below 1 damps, above 1 overshoots.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Correlated metric the calibrator learns and predictors read.
    #[serde(default = "default_calibration_metric")]
    pub metric: String,
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval: String,
}

fn default_watch_interval() -> String {
    "5s".to_string()
}

fn default_factor() -> f64 {
    0.5
}

fn default_calibration_metric() -> String {
    "peers".to_string()
}

fn default_autosave_interval() -> String {
    "60s".to_string()
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a daemon config rooted at `dir`.
    pub fn scaffold(dir: &Path) -> Self {
        FleetConfig {
            workload_file: dir.join("workload.toml"),
            controllers_file: Some(dir.join("controllers.toml")),
            watch_interval: default_watch_interval(),
            calibration: Some(CalibrationConfig {
                state_file: dir.join("calibration.json"),
                factor: default_factor(),
                metric: default_calibration_metric(),
                autosave_interval: default_autosave_interval(),
            }),
        }
    }

    pub fn watch_interval(&self) -> ConfigResult<Duration> {
        parse_duration(&self.watch_interval)
    }
}

impl CalibrationConfig {
    pub fn autosave_interval(&self) -> ConfigResult<Duration> {
        parse_duration(&self.autosave_interval)
    }
}

/// Parse `"500ms"`, `"30s"` or `"2m"` style durations.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let invalid = || ConfigError::Duration(s.to_string());
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().map(Duration::from_secs).map_err(|_| invalid())
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|_| invalid())
    } else {
        Err(invalid())
    }
}
