//! Background task that periodically saves a shared calibrator.
//!
//! Save failures are logged and retried on the next tick; in-memory state
//! is never touched by a failed save.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::calibrator::LoadCalibrator;
use crate::persist::write_prediction_data;

/// A calibrator shared between the feedback path and the autosave task.
pub type SharedCalibrator = Arc<Mutex<LoadCalibrator>>;

/// Spawn the autosave loop. It saves whenever the calibrator's revision has
/// moved since the last successful save, and once more on shutdown.
pub fn spawn_autosave(
    calibrator: SharedCalibrator,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut saved_revision = None;
        info!(path = %path.display(), ?interval, "calibration autosave started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    save_if_changed(&calibrator, &path, &mut saved_revision).await;
                }
                _ = shutdown.changed() => {
                    save_if_changed(&calibrator, &path, &mut saved_revision).await;
                    debug!("calibration autosave shutting down");
                    break;
                }
            }
        }
    })
}

/// Save the calibrator if it changed since `saved_revision`. Returns whether
/// the file is now up to date.
pub async fn save_if_changed(
    calibrator: &SharedCalibrator,
    path: &std::path::Path,
    saved_revision: &mut Option<u64>,
) -> bool {
    let (revision, data) = {
        let guard = calibrator.lock().await;
        if *saved_revision == Some(guard.revision()) {
            return true;
        }
        (guard.revision(), guard.prediction_data())
    };

    let target = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || write_prediction_data(&target, &data)).await;

    match result {
        Ok(Ok(())) => {
            *saved_revision = Some(revision);
            debug!(path = %path.display(), revision, "calibration saved");
            true
        }
        Ok(Err(e)) => {
            error!(path = %path.display(), error = %format!("{e:#}"), "failed to save calibration, will retry");
            false
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "calibration save task failed, will retry");
            false
        }
    }
}
