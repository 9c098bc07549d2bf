//! Load predictor: maps a fast correlated metric to a predicted level.
//!
//! The real load metric updates slowly; peer counts change on every join
//! and leave. The predictor runs the same banded search as the feedback
//! controller against a calibration table, giving the balancer a faster
//! (if less precise) level between real feedback ticks.

use fleet_core::{BandTable, Level};

use crate::controller::{LevelController, TableHandle};

#[derive(Debug)]
pub struct LoadPredictor {
    inner: LevelController,
}

impl LoadPredictor {
    pub fn new(metric: impl Into<String>, initial: Level, table: BandTable) -> Self {
        Self {
            inner: LevelController::new(metric, initial, table),
        }
    }

    /// Create a predictor reading a calibration table shared with other
    /// predictors of the same metric.
    pub fn with_table_handle(metric: impl Into<String>, initial: Level, table: TableHandle) -> Self {
        Self {
            inner: LevelController::with_handle(metric, initial, table),
        }
    }

    /// Feed the current peer (connection) count and return the predicted level.
    pub fn set_peer_count(&mut self, peers: i64) -> Level {
        self.inner.set(peers)
    }

    /// The most recent prediction.
    pub fn predicted_level(&self) -> Level {
        self.inner.level()
    }

    pub fn peer_count(&self) -> Option<i64> {
        self.inner.input()
    }

    pub fn metric(&self) -> &str {
        self.inner.name()
    }

    /// Swap in a new calibration table. The next `set_peer_count` uses it.
    pub fn update_prediction_levels(&self, table: BandTable) {
        self.inner.publish(table);
    }

    /// Handle for publishing calibration tables from another task.
    pub fn table_handle(&self) -> TableHandle {
        self.inner.handle()
    }

    /// The calibration table currently in effect.
    pub fn prediction_levels(&self) -> std::sync::Arc<BandTable> {
        self.inner.handle().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Level::*;

    fn peers_table() -> BandTable {
        BandTable::from_triples([
            (Level0, 100, 0),
            (Level2, 250, 90),
            (Level5, 500, 230),
            (Level9, i64::MAX, 480),
        ])
        .unwrap()
    }

    #[test]
    fn predicts_from_peer_count() {
        let mut predictor = LoadPredictor::new("peers", Level0, peers_table());

        assert_eq!(predictor.set_peer_count(50), Level0);
        assert_eq!(predictor.set_peer_count(120), Level2);
        assert_eq!(predictor.set_peer_count(95), Level2);
        assert_eq!(predictor.set_peer_count(600), Level::HIGHEST);
        assert_eq!(predictor.set_peer_count(300), Level5);
        assert_eq!(predictor.peer_count(), Some(300));
    }

    #[test]
    fn updated_levels_take_effect_on_next_count() {
        let mut predictor = LoadPredictor::new("peers", Level0, peers_table());
        assert_eq!(predictor.set_peer_count(120), Level2);

        let tighter = BandTable::from_triples([
            (Level0, 100, 0),
            (Level2, 110, 90),
            (Level5, 500, 105),
        ])
        .unwrap();
        predictor.update_prediction_levels(tighter.clone());

        assert_eq!(*predictor.prediction_levels(), tighter);
        assert_eq!(predictor.set_peer_count(120), Level5);
    }

    #[test]
    fn handle_publishes_across_threads() {
        let mut predictor = LoadPredictor::new("peers", Level0, BandTable::new());
        let handle = predictor.table_handle();

        std::thread::spawn(move || handle.publish(peers_table()))
            .join()
            .unwrap();

        assert_eq!(predictor.set_peer_count(300), Level5);
    }
}
