//! fleet-feedback — from raw load samples to stable workload levels.
//!
//! # Architecture
//!
//! ```text
//! raw metric (cpu, ...)   ──► FeedbackController ──► Level ─┐
//!                                                          ├──► LoadBalancer
//! peer count              ──► LoadPredictor ───────► Level ─┘
//!                                   ▲
//!                                   │ update_prediction_levels(snapshot)
//! (peer count, real level) ──► LoadCalibrator ──► save / load (JSON)
//! ```
//!
//! Controllers and predictors share one banded hysteresis search. Their
//! tables sit behind a `TableHandle` so a reloader or calibrator can publish
//! a replacement atomically. The calibrator never shares mutable state with
//! a predictor: it hands out owned table copies.

pub mod autosave;
pub mod calibrator;
pub mod controller;
pub mod error;
pub mod persist;
pub mod predictor;

pub use autosave::{spawn_autosave, SharedCalibrator};
pub use calibrator::{LoadCalibrator, PredictionData, DEFAULT_FACTOR};
pub use controller::{controllers_from_file, FeedbackController, TableHandle};
pub use error::{CalibrationError, CalibrationResult};
pub use predictor::LoadPredictor;
