//! fleet-core — shared vocabulary of the fleet capacity core.
//!
//! - **`level`** — the discrete workload `Level` order
//! - **`band`** — `LevelBand`, `BandTable` and the banded hysteresis search
//! - **`config`** — workload, controllers and daemon TOML files
//! - **`types`** — `ServerState` and other shared enums

pub mod band;
pub mod config;
pub mod error;
pub mod level;
pub mod types;

pub use band::{BandTable, BandTriple, LevelBand};
pub use config::{ControllerThresholds, FleetConfig, WorkloadSettings};
pub use error::{ConfigError, ConfigResult};
pub use level::{Level, LEVELS_COUNT};
pub use types::ServerState;
