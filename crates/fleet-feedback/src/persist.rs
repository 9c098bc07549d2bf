//! Persist calibration tables to disk (JSON) so learning survives restarts.

use std::path::Path;

use anyhow::{Context, Result};

use crate::calibrator::{LoadCalibrator, PredictionData};

impl LoadCalibrator {
    /// Save all tables to `path` (creates the parent dir if needed).
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        write_prediction_data(path, &self.prediction_data())
    }

    /// Load tables from `path`. A missing file yields `None` so the caller
    /// can start from an empty calibrator.
    pub fn load_from_path(path: &Path) -> Result<Option<LoadCalibrator>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read calibration: {}", path.display())),
        };
        let data: PredictionData = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse calibration: {}", path.display()))?;
        let calibrator = LoadCalibrator::from_prediction_data(data)
            .with_context(|| format!("validate calibration: {}", path.display()))?;
        Ok(Some(calibrator))
    }
}

/// Write a snapshot through a temp file and rename, so readers never see a
/// half-written file and a failed write leaves the previous file intact.
pub fn write_prediction_data(path: &Path, data: &PredictionData) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(data).context("serialize calibration")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("write calibration: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("replace calibration: {}", path.display()))?;
    Ok(())
}
