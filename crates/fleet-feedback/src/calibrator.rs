//! Load calibrator, which learns prediction thresholds from observations.
//!
//! Every time the real feedback level of a server is known, the calibrator
//! is told which level was observed at which value of the correlated metric
//! (e.g. peer count). When the sample falls outside the stored band for the
//! observed level, the offending boundary is nudged toward the sample:
//!
//! ```text
//! sample > upper(L):  upper(L) += round((sample - upper(L)) * factor)
//!                     lower(L+1) moves up by the same step
//! sample < lower(L):  lower(L) -= round((lower(L) - sample) * factor)
//!                     upper(L-1) moves down by the same step
//! ```
//!
//! A factor below 1 converges slowly and conservatively; above 1 it
//! overshoots and may oscillate before settling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use fleet_core::{BandTable, BandTriple, Level, LevelBand};

use crate::error::{CalibrationError, CalibrationResult};

/// Default adaptation factor.
pub const DEFAULT_FACTOR: f64 = 0.5;

/// Serialisable calibration snapshot, used both on the wire (seeding a
/// replica) and as the persisted file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionData {
    pub factor: f64,
    /// Metric name → `[level, upper, lower]` rows in ascending level order.
    pub metrics: BTreeMap<String, Vec<BandTriple>>,
}

/// Per-metric calibration tables plus the adaptation factor.
#[derive(Debug, Clone)]
pub struct LoadCalibrator {
    factor: f64,
    tables: BTreeMap<String, BandTable>,
    /// Bumped on every threshold change.
    revision: u64,
}

impl LoadCalibrator {
    pub fn new(factor: f64) -> CalibrationResult<Self> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(CalibrationError::InvalidFactor(factor));
        }
        Ok(Self {
            factor,
            tables: BTreeMap::new(),
            revision: 0,
        })
    }

    /// Seed a metric with an initial table.
    pub fn with_table(mut self, metric: impl Into<String>, table: BandTable) -> Self {
        self.tables.insert(metric.into(), table);
        self
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Change the adaptation factor. Tables are kept as they are.
    pub fn set_factor(&mut self, factor: f64) -> CalibrationResult<()> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(CalibrationError::InvalidFactor(factor));
        }
        self.factor = factor;
        Ok(())
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn table(&self, metric: &str) -> Option<&BandTable> {
        self.tables.get(metric)
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Record that `observed` was the true level while the correlated metric
    /// read `sample`.
    ///
    /// Returns a copy of the metric's updated table when a threshold moved,
    /// `None` when nothing changed.
    pub fn update_prediction(
        &mut self,
        metric: &str,
        sample: i64,
        observed: Level,
    ) -> Option<BandTable> {
        let factor = self.factor;
        let table = self.tables.entry(metric.to_string()).or_default();

        let changed = match table.get(observed).copied() {
            None => {
                table.insert(observed, LevelBand::new(sample, sample));
                true
            }
            Some(band) if sample > band.upper => {
                let step = nudge(sample, band.upper, factor);
                step != 0 && raise_boundary(table, observed, step)
            }
            Some(band) if sample < band.lower => {
                let step = nudge(band.lower, sample, factor);
                step != 0 && lower_boundary(table, observed, step)
            }
            Some(_) => false,
        };

        if !changed {
            trace!(%metric, sample, level = %observed, "calibration unchanged");
            return None;
        }

        self.revision += 1;
        debug!(
            %metric,
            sample,
            level = %observed,
            revision = self.revision,
            "calibration thresholds adjusted"
        );
        Some(table.clone())
    }

    /// Snapshot of every metric's table.
    pub fn prediction_data(&self) -> PredictionData {
        PredictionData {
            factor: self.factor,
            metrics: self
                .tables
                .iter()
                .map(|(metric, table)| (metric.clone(), table.to_triples()))
                .collect(),
        }
    }

    /// Replace all tables (and the factor) with a received snapshot.
    pub fn apply_prediction_data(&mut self, data: PredictionData) -> CalibrationResult<()> {
        let rebuilt = Self::from_prediction_data(data)?;
        self.factor = rebuilt.factor;
        self.tables = rebuilt.tables;
        self.revision += 1;
        Ok(())
    }

    /// Build a calibrator from a snapshot.
    pub fn from_prediction_data(data: PredictionData) -> CalibrationResult<Self> {
        let mut calibrator = Self::new(data.factor)?;
        for (metric, rows) in data.metrics {
            let table = BandTable::from_triples(rows).map_err(|source| CalibrationError::Table {
                metric: metric.clone(),
                source,
            })?;
            calibrator.tables.insert(metric, table);
        }
        Ok(calibrator)
    }
}

/// Scaled distance from `from` toward `to`, rounded to the nearest step.
fn nudge(to: i64, from: i64, factor: f64) -> i64 {
    ((to as f64 - from as f64) * factor).round() as i64
}

fn raise_boundary(table: &mut BandTable, level: Level, step: i64) -> bool {
    let Some(band) = table.get_mut(level) else {
        return false;
    };
    band.upper = band.upper.saturating_add(step);

    if let Some(above) = level.next().and_then(|next| table.get_mut(next)) {
        above.lower = above.lower.saturating_add(step).min(above.upper);
    }
    true
}

fn lower_boundary(table: &mut BandTable, level: Level, step: i64) -> bool {
    let Some(band) = table.get_mut(level) else {
        return false;
    };
    band.lower = band.lower.saturating_sub(step);

    if let Some(below) = level.prev().and_then(|prev| table.get_mut(prev)) {
        below.upper = below.upper.saturating_sub(step).max(below.lower);
    }
    true
}
