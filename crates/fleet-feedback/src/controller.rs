//! Feedback controller: turns a raw load metric into a stable level.
//!
//! Each controller owns its current level and reads its band table through
//! a `TableHandle`. The handle can be cloned into a config reloader or a
//! calibrator so a replacement table is published atomically: the next
//! input sees either the old table or the new one, never a mix.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use fleet_core::config::{load_controller_thresholds, ControllerThresholds};
use fleet_core::{BandTable, ConfigResult, Level};

/// Shared, atomically replaceable band table.
#[derive(Debug, Clone)]
pub struct TableHandle {
    inner: Arc<ArcSwap<BandTable>>,
}

impl TableHandle {
    pub fn new(table: BandTable) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    /// Replace the whole table.
    pub fn publish(&self, table: BandTable) {
        self.inner.store(Arc::new(table));
    }

    /// The table currently in effect.
    pub fn snapshot(&self) -> Arc<BandTable> {
        self.inner.load_full()
    }
}

/// Band-search state shared by feedback controllers and load predictors.
#[derive(Debug)]
pub(crate) struct LevelController {
    name: String,
    table: TableHandle,
    current: Level,
    input: Option<i64>,
}

impl LevelController {
    pub(crate) fn new(name: impl Into<String>, initial: Level, table: BandTable) -> Self {
        Self::with_handle(name, initial, TableHandle::new(table))
    }

    pub(crate) fn with_handle(name: impl Into<String>, initial: Level, table: TableHandle) -> Self {
        Self {
            name: name.into(),
            table,
            current: initial,
            input: None,
        }
    }

    pub(crate) fn set(&mut self, value: i64) -> Level {
        let table = self.table.inner.load();
        let next = table.resolve(self.current, value);
        if next != self.current {
            debug!(
                metric = %self.name,
                value,
                from = %self.current,
                to = %next,
                "level changed"
            );
        }
        self.current = next;
        self.input = Some(value);
        next
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn level(&self) -> Level {
        self.current
    }

    pub(crate) fn input(&self) -> Option<i64> {
        self.input
    }

    pub(crate) fn handle(&self) -> TableHandle {
        self.table.clone()
    }

    pub(crate) fn publish(&self, table: BandTable) {
        debug!(metric = %self.name, bands = table.len(), "band table replaced");
        self.table.publish(table);
    }
}

/// Converts a raw metric (CPU, bandwidth, ...) into a workload level.
#[derive(Debug)]
pub struct FeedbackController {
    inner: LevelController,
}

impl FeedbackController {
    /// Create a controller starting at `initial`. An empty table keeps the
    /// controller at `initial` until a table is published.
    pub fn new(metric: impl Into<String>, initial: Level, table: BandTable) -> Self {
        Self {
            inner: LevelController::new(metric, initial, table),
        }
    }

    /// Create a controller reading a table shared with other controllers.
    /// Publishing through `table` reaches all of them at once.
    pub fn with_table_handle(metric: impl Into<String>, initial: Level, table: TableHandle) -> Self {
        Self {
            inner: LevelController::with_handle(metric, initial, table),
        }
    }

    /// Create a controller from one entry of a controllers file.
    pub fn from_thresholds(metric: impl Into<String>, thresholds: &ControllerThresholds) -> Self {
        Self::new(metric, thresholds.initial_level, thresholds.table.clone())
    }

    /// Feed a raw sample and return the resulting level.
    pub fn set_input(&mut self, value: i64) -> Level {
        self.inner.set(value)
    }

    /// The current output level.
    pub fn output(&self) -> Level {
        self.inner.level()
    }

    /// The most recent sample, if any.
    pub fn current_input(&self) -> Option<i64> {
        self.inner.input()
    }

    pub fn metric(&self) -> &str {
        self.inner.name()
    }

    /// Replace the band table.
    pub fn update_thresholds(&self, table: BandTable) {
        self.inner.publish(table);
    }

    /// Handle for publishing tables from another task.
    pub fn table_handle(&self) -> TableHandle {
        self.inner.handle()
    }
}

/// Build one controller per metric from a controllers file.
pub fn controllers_from_file(path: &Path) -> ConfigResult<BTreeMap<String, FeedbackController>> {
    let thresholds = load_controller_thresholds(path)?;
    Ok(thresholds
        .iter()
        .map(|(metric, t)| (metric.clone(), FeedbackController::from_thresholds(metric.clone(), t)))
        .collect())
}
