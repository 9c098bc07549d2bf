//! Discrete workload levels.
//!
//! A `Level` is the stable, discrete signal produced from a noisy load
//! metric. Levels form a small total order `Level0 < Level1 < ... < Level9`;
//! `Lowest` and `Highest` name the two ends of that order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Number of distinct workload levels.
pub const LEVELS_COUNT: usize = 10;

/// A discrete workload rank.
///
/// Serialised as its integer index (`0..=9`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Level {
    #[default]
    Level0,
    Level1,
    Level2,
    Level3,
    Level4,
    Level5,
    Level6,
    Level7,
    Level8,
    Level9,
}

impl Level {
    /// The least loaded level.
    pub const LOWEST: Level = Level::Level0;
    /// The most loaded level.
    pub const HIGHEST: Level = Level::Level9;

    /// All levels in ascending order.
    pub const ALL: [Level; LEVELS_COUNT] = [
        Level::Level0,
        Level::Level1,
        Level::Level2,
        Level::Level3,
        Level::Level4,
        Level::Level5,
        Level::Level6,
        Level::Level7,
        Level::Level8,
        Level::Level9,
    ];

    /// Position of this level in the order, `0..LEVELS_COUNT`.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Level at the given position, if it exists.
    pub fn from_index(index: usize) -> Option<Level> {
        Self::ALL.get(index).copied()
    }

    /// The level one step up, or `None` at `Highest`.
    pub fn next(self) -> Option<Level> {
        Self::from_index(self.index() + 1)
    }

    /// The level one step down, or `None` at `Lowest`.
    pub fn prev(self) -> Option<Level> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }

    /// Round a fractional level (e.g. an average) to the nearest level,
    /// clamping into range.
    pub fn from_average(value: f64) -> Level {
        if !value.is_finite() || value <= 0.0 {
            return Level::LOWEST;
        }
        let rounded = value.round() as usize;
        Self::from_index(rounded.min(LEVELS_COUNT - 1)).unwrap_or(Level::HIGHEST)
    }
}

impl TryFrom<u8> for Level {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Level::from_index(value as usize).ok_or(ConfigError::InvalidLevel(value))
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> u8 {
        level as u8
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Level{}", self.index())
    }
}
