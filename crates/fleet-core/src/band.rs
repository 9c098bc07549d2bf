//! Level bands and the banded hysteresis search.
//!
//! A `BandTable` maps each configured level to an `(upper, lower)` range.
//! Bands of adjacent levels usually overlap; the overlap is the hysteresis
//! margin that keeps the output level from flapping when a metric hovers
//! around a boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::level::Level;

/// Inclusive numeric range a metric must fall in to map to a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelBand {
    pub upper: i64,
    pub lower: i64,
}

impl LevelBand {
    pub fn new(upper: i64, lower: i64) -> Self {
        Self { upper, lower }
    }

    /// Whether `value` lies within `[lower, upper]`.
    pub fn contains(&self, value: i64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// A `(level, upper, lower)` row as it appears in config and state files.
pub type BandTriple = (Level, i64, i64);

/// Ordered mapping from level to band.
///
/// Tables are treated as immutable snapshots once handed to a controller;
/// reconfiguration publishes a whole new table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BandTable {
    bands: BTreeMap<Level, LevelBand>,
}

impl BandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(level, upper, lower)` rows.
    ///
    /// Rejects duplicate levels and rows whose upper bound is below the
    /// lower bound.
    pub fn from_triples<I>(rows: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = BandTriple>,
    {
        let mut bands = BTreeMap::new();
        for (level, upper, lower) in rows {
            if upper < lower {
                return Err(ConfigError::InvertedBand { level, upper, lower });
            }
            if bands.insert(level, LevelBand::new(upper, lower)).is_some() {
                return Err(ConfigError::DuplicateLevel(level));
            }
        }
        Ok(Self { bands })
    }

    /// Rows in ascending level order.
    pub fn to_triples(&self) -> Vec<BandTriple> {
        self.bands
            .iter()
            .map(|(level, band)| (*level, band.upper, band.lower))
            .collect()
    }

    pub fn get(&self, level: Level) -> Option<&LevelBand> {
        self.bands.get(&level)
    }

    pub fn get_mut(&mut self, level: Level) -> Option<&mut LevelBand> {
        self.bands.get_mut(&level)
    }

    /// Insert or replace a band. Intended for building tables before they
    /// are published.
    pub fn insert(&mut self, level: Level, band: LevelBand) -> Option<LevelBand> {
        self.bands.insert(level, band)
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Level, &LevelBand)> {
        self.bands.iter().map(|(level, band)| (*level, band))
    }

    /// Map `value` to a level, starting from `current`.
    ///
    /// The search is one-sided: when the value leaves the current band
    /// upwards only upper bounds of higher levels are consulted, and when it
    /// leaves downwards only lower bounds of lower levels. Missing levels are
    /// skipped, so sparse tables bridge their gaps to the nearest configured
    /// band. An empty table never moves the level.
    pub fn resolve(&self, current: Level, value: i64) -> Level {
        if self.bands.is_empty() {
            return current;
        }

        let Some(band) = self.bands.get(&current) else {
            return self.place_fresh(value);
        };

        if band.contains(value) {
            current
        } else if value > band.upper {
            self.bands
                .range(current..)
                .skip(1)
                .find(|(_, b)| value <= b.upper)
                .map(|(level, _)| *level)
                .unwrap_or(Level::HIGHEST)
        } else {
            self.bands
                .range(..current)
                .rev()
                .find(|(_, b)| value >= b.lower)
                .map(|(level, _)| *level)
                .unwrap_or(Level::LOWEST)
        }
    }

    fn place_fresh(&self, value: i64) -> Level {
        self.bands
            .iter()
            .find(|(_, b)| value <= b.upper)
            .map(|(level, _)| *level)
            .unwrap_or(Level::HIGHEST)
    }
}

impl FromIterator<(Level, LevelBand)> for BandTable {
    fn from_iter<I: IntoIterator<Item = (Level, LevelBand)>>(iter: I) -> Self {
        Self {
            bands: iter.into_iter().collect(),
        }
    }
}
