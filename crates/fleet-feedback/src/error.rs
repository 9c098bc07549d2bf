//! Feedback error types.

use thiserror::Error;

use fleet_core::ConfigError;

/// Result type alias for calibration operations.
pub type CalibrationResult<T> = Result<T, CalibrationError>;

/// Errors that can occur while building or seeding a calibrator.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("adaptation factor must be a positive finite number, got {0}")]
    InvalidFactor(f64),

    #[error("invalid calibration table for metric {metric}: {source}")]
    Table {
        metric: String,
        #[source]
        source: ConfigError,
    },
}
