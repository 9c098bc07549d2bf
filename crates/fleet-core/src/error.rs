//! Configuration error types.

use thiserror::Error;

use crate::level::{Level, LEVELS_COUNT};

/// Result type alias for configuration parsing and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
///
/// A configuration error never replaces a good configuration already in
/// use; callers keep the previous value and report the error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid level index {0} (expected 0..{count})", count = LEVELS_COUNT)]
    InvalidLevel(u8),

    #[error("expected {expected} load level weights, found {found}")]
    WeightsLength { expected: usize, found: usize },

    #[error("reserve ratio must be within [0, 1], got {0}")]
    ReserveRatio(f64),

    #[error("priority down threshold {down} is above up threshold {up}")]
    Thresholds { up: Level, down: Level },

    #[error("band for {level} has upper bound {upper} below lower bound {lower}")]
    InvertedBand { level: Level, upper: i64, lower: i64 },

    #[error("level {0} appears more than once in band table")]
    DuplicateLevel(Level),

    #[error("invalid duration: {0}")]
    Duration(String),
}
