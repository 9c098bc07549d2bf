//! One priority tier of servers with its reserve pool.
//!
//! A bunch keeps its records in arrival order. Part of the tier (sized by
//! the reserve ratio) is *designated* reserve; a designated server is either
//! held back (`in_reserve`) or temporarily pulled into use. Only servers in
//! use contribute to the tier's workload aggregate, and every mutation goes
//! through a method that keeps the reserve count and the aggregate in step.

use std::fmt::Debug;

use fleet_core::{Level, ServerState};
use tracing::debug;

/// A registered server as seen by its tier.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRecord<T> {
    handle: T,
    level: Level,
    weight: u32,
    state: ServerState,
    is_reserved: bool,
    is_in_reserve: bool,
    pulled_at: Option<u64>,
}

impl<T> ServerRecord<T> {
    fn new(handle: T, level: Level, weight: u32, state: ServerState) -> Self {
        Self {
            handle,
            level,
            weight,
            state,
            is_reserved: false,
            is_in_reserve: false,
            pulled_at: None,
        }
    }

    /// Caller-supplied server identity.
    pub fn handle(&self) -> &T {
        &self.handle
    }

    /// Last reported load level.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Per-server multiplier applied on top of the level weight.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Last reported rotation state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Counted toward the tier's reserve, whether held back or pulled.
    pub fn is_reserved(&self) -> bool {
        self.is_reserved
    }

    /// Held back from selection.
    pub fn is_in_reserve(&self) -> bool {
        self.is_in_reserve
    }

    /// In rotation and not held back in reserve.
    pub fn is_in_use(&self) -> bool {
        self.state.is_normal() && !self.is_in_reserve
    }

    fn contribution(&self) -> Option<Level> {
        self.is_in_use().then_some(self.level)
    }
}

/// Result of removing a server from a bunch.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal<T> {
    pub record: ServerRecord<T>,
    /// A reserve server promoted into use because the reserve shrank.
    pub taken_from_reserve: Option<T>,
}

/// Servers sharing one priority.
#[derive(Debug, Clone)]
pub struct ServerBunch<T> {
    priority: u8,
    reserve_ratio: f64,
    records: Vec<ServerRecord<T>>,
    in_use_count: usize,
    in_use_workload: u64,
    pulls: u64,
}

impl<T: Clone + Eq + Debug> ServerBunch<T> {
    /// Empty tier. The ratio is clamped to `[0, 1]`.
    pub fn new(priority: u8, reserve_ratio: f64) -> Self {
        Self {
            priority,
            reserve_ratio: reserve_ratio.clamp(0.0, 1.0),
            records: Vec::new(),
            in_use_count: 0,
            in_use_workload: 0,
            pulls: 0,
        }
    }

    /// Priority this tier serves; lower is preferred.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Share of servers in rotation designated as reserve.
    pub fn reserve_ratio(&self) -> f64 {
        self.reserve_ratio
    }

    /// Number of registered servers, in any state.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no server is registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `handle` is registered in this tier.
    pub fn contains(&self, handle: &T) -> bool {
        self.position(handle).is_some()
    }

    /// Record for `handle`, if registered here.
    pub fn get(&self, handle: &T) -> Option<&ServerRecord<T>> {
        self.position(handle).map(|idx| &self.records[idx])
    }

    /// Records in arrival order.
    pub fn records(&self) -> impl Iterator<Item = &ServerRecord<T>> {
        self.records.iter()
    }

    /// Servers in rotation (state `Normal`), reserved or not.
    pub fn normal_count(&self) -> usize {
        self.records.iter().filter(|r| r.state.is_normal()).count()
    }

    /// Servers designated as reserve, held or pulled.
    pub fn reserved_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_reserved).count()
    }

    /// Reserve servers currently held back.
    pub fn in_reserve_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_in_reserve).count()
    }

    /// Servers contributing to the workload aggregate.
    pub fn in_use_count(&self) -> usize {
        self.in_use_count
    }

    /// Sum of level indices over servers in use.
    pub fn in_use_workload(&self) -> u64 {
        self.in_use_workload
    }

    /// Mean level index over servers in use; `None` when nothing is in use.
    pub fn in_use_average(&self) -> Option<f64> {
        (self.in_use_count > 0).then(|| self.in_use_workload as f64 / self.in_use_count as f64)
    }

    /// Tier load used for threshold decisions. A tier with nothing in use
    /// reads as saturated.
    pub fn tier_level(&self) -> Level {
        self.in_use_average()
            .map(Level::from_average)
            .unwrap_or(Level::HIGHEST)
    }

    /// Reserve size required for the current number of servers in rotation.
    pub fn required_reserve(&self) -> usize {
        required_reserve(self.normal_count(), self.reserve_ratio)
    }

    /// Append a server. Fails if the handle is already present.
    pub fn try_add_server(&mut self, handle: T, level: Level, weight: u32) -> bool {
        self.try_add_server_with_state(handle, level, weight, ServerState::Normal)
    }

    pub(crate) fn try_add_server_with_state(
        &mut self,
        handle: T,
        level: Level,
        weight: u32,
        state: ServerState,
    ) -> bool {
        if self.contains(&handle) {
            return false;
        }
        let record = ServerRecord::new(handle, level, weight, state);
        self.update_total_workload(None, record.contribution());
        self.records.push(record);
        self.rebalance_reserve();
        true
    }

    /// Remove a server. If the reserve shrinks as a result, a server held in
    /// reserve may be promoted into use; it is reported in the removal.
    pub fn remove_server(&mut self, handle: &T) -> Option<Removal<T>> {
        let idx = self.position(handle)?;
        let record = self.records.remove(idx);
        self.update_total_workload(record.contribution(), None);
        let taken_from_reserve = self.rebalance_reserve().into_iter().next();
        Some(Removal {
            record,
            taken_from_reserve,
        })
    }

    /// Change a server's level and rotation state. A server returning to
    /// `Normal` rejoins at the back of the tier, as if freshly added.
    /// Returns servers promoted out of reserve by the change.
    pub fn update_server(&mut self, handle: &T, level: Level, state: ServerState) -> Option<Vec<T>> {
        let mut idx = self.position(handle)?;
        let previous_state = self.records[idx].state;

        if previous_state != state && state.is_normal() {
            let record = self.records.remove(idx);
            self.records.push(record);
            idx = self.records.len() - 1;
        }

        self.mutate(idx, |r| {
            r.level = level;
            r.state = state;
            if !state.is_normal() {
                r.is_reserved = false;
                r.is_in_reserve = false;
                r.pulled_at = None;
            }
        });

        if previous_state == state {
            return Some(Vec::new());
        }
        Some(self.rebalance_reserve())
    }

    /// Change the reserve ratio and resize the reserve. Returns servers
    /// promoted out of reserve.
    pub fn set_reserve_ratio(&mut self, ratio: f64) -> Vec<T> {
        self.reserve_ratio = ratio.clamp(0.0, 1.0);
        self.rebalance_reserve()
    }

    /// Pull the least loaded server held in reserve into use.
    pub fn get_server_from_reserve(&mut self) -> Option<T> {
        let idx = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_in_reserve)
            .min_by_key(|(idx, r)| (r.level, *idx))
            .map(|(idx, _)| idx)?;

        self.pulls += 1;
        let pull = self.pulls;
        self.mutate(idx, |r| {
            r.is_in_reserve = false;
            r.pulled_at = Some(pull);
        });
        Some(self.records[idx].handle.clone())
    }

    /// The reserved server that should go back first: the one pulled most
    /// recently.
    pub fn next_server_to_return(&self) -> Option<&T> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_reserved && !r.is_in_reserve && r.state.is_normal())
            .max_by_key(|(idx, r)| (r.pulled_at, *idx))
            .map(|(_, r)| &r.handle)
    }

    /// Put a reserved server that is currently in use back into reserve.
    pub fn return_server_into_reserve(&mut self, handle: &T) -> bool {
        let Some(idx) = self.position(handle) else {
            return false;
        };
        let record = &self.records[idx];
        if !record.is_reserved || record.is_in_reserve || !record.state.is_normal() {
            return false;
        }
        self.mutate(idx, |r| {
            r.is_in_reserve = true;
            r.pulled_at = None;
        });
        true
    }

    fn position(&self, handle: &T) -> Option<usize> {
        self.records.iter().position(|r| &r.handle == handle)
    }

    /// Apply a change to one record and carry its aggregate contribution over.
    fn mutate(&mut self, idx: usize, change: impl FnOnce(&mut ServerRecord<T>)) {
        let record = &mut self.records[idx];
        let before = record.contribution();
        change(record);
        let after = record.contribution();
        self.update_total_workload(before, after);
    }

    /// Move a record's share of the in-use aggregate from `old` to `new`.
    /// `None` means the record does not count (held in reserve or out of
    /// rotation).
    fn update_total_workload(&mut self, old: Option<Level>, new: Option<Level>) {
        if let Some(level) = old {
            self.in_use_count -= 1;
            self.in_use_workload -= level.index() as u64;
        }
        if let Some(level) = new {
            self.in_use_count += 1;
            self.in_use_workload += level.index() as u64;
        }
    }

    /// Bring the reserve back to its required size. Returns servers promoted
    /// from reserve into use.
    fn rebalance_reserve(&mut self) -> Vec<T> {
        let required = self.required_reserve();
        let mut promoted = Vec::new();

        while self.reserved_count() > required {
            let in_use = self
                .records
                .iter()
                .position(|r| r.is_reserved && !r.is_in_reserve);
            if let Some(idx) = in_use {
                self.mutate(idx, |r| {
                    r.is_reserved = false;
                    r.pulled_at = None;
                });
                continue;
            }
            let Some(idx) = self.records.iter().position(|r| r.is_in_reserve) else {
                break;
            };
            self.mutate(idx, |r| {
                r.is_reserved = false;
                r.is_in_reserve = false;
            });
            promoted.push(self.records[idx].handle.clone());
        }

        while self.reserved_count() < required {
            let Some(idx) = self
                .records
                .iter()
                .rposition(|r| r.state.is_normal() && !r.is_reserved)
            else {
                break;
            };
            self.mutate(idx, |r| {
                r.is_reserved = true;
                r.is_in_reserve = true;
            });
            debug!(priority = self.priority, server = ?self.records[idx].handle, "server designated reserve");
        }

        for handle in &promoted {
            debug!(priority = self.priority, server = ?handle, "server promoted out of reserve");
        }
        promoted
    }
}

/// `ceil(normal * ratio)`, tolerant of float noise in the ratio.
pub fn required_reserve(normal: usize, ratio: f64) -> usize {
    let exact = normal as f64 * ratio.clamp(0.0, 1.0);
    let required = (exact - 1e-9).ceil().max(0.0) as usize;
    required.min(normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bunch_with(ratio: f64, levels: &[Level]) -> ServerBunch<u32> {
        let mut bunch = ServerBunch::new(0, ratio);
        for (i, level) in levels.iter().enumerate() {
            assert!(bunch.try_add_server(i as u32, *level, 1));
        }
        bunch
    }

    #[test]
    fn required_reserve_rounds_up() {
        assert_eq!(required_reserve(0, 0.2), 0);
        assert_eq!(required_reserve(1, 0.2), 1);
        assert_eq!(required_reserve(5, 0.2), 1);
        assert_eq!(required_reserve(6, 0.2), 2);
        assert_eq!(required_reserve(10, 0.7), 7);
        assert_eq!(required_reserve(3, 1.0), 3);
        assert_eq!(required_reserve(4, 0.0), 0);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut bunch = ServerBunch::new(0, 0.0);
        assert!(bunch.try_add_server(1, Level::Level1, 1));
        assert!(!bunch.try_add_server(1, Level::Level5, 1));
        assert_eq!(bunch.len(), 1);
        assert_eq!(bunch.get(&1).unwrap().level(), Level::Level1);
    }

    #[test]
    fn most_recent_server_becomes_reserve() {
        let bunch = bunch_with(0.2, &[Level::Level1; 6]);
        assert_eq!(bunch.reserved_count(), 2);
        let reserved: Vec<u32> = bunch
            .records()
            .filter(|r| r.is_reserved())
            .map(|r| *r.handle())
            .collect();
        // The first server was designated when it was alone in the tier.
        assert_eq!(reserved, vec![0, 5]);
        assert_eq!(bunch.in_use_count(), 4);
    }

    #[test]
    fn reserve_never_counts_toward_workload() {
        let mut bunch = bunch_with(0.5, &[Level::Level2, Level::Level2]);
        assert_eq!(bunch.in_use_count(), 1);
        assert_eq!(bunch.in_use_workload(), 2);

        // Server 0 sits in reserve; its level changes but the aggregate does not.
        assert!(bunch.get(&0).unwrap().is_in_reserve());
        bunch.update_server(&0, Level::Level9, ServerState::Normal);
        assert_eq!(bunch.in_use_workload(), 2);
        assert_eq!(bunch.tier_level(), Level::Level2);
    }

    #[test]
    fn pull_and_return_reserve() {
        let mut bunch = bunch_with(0.5, &[Level::Level1, Level::Level1, Level::Level1, Level::Level1]);
        // Servers 0 and 2 were designated as the tier grew.
        bunch.update_server(&2, Level::Level0, ServerState::Normal);
        assert_eq!(bunch.in_reserve_count(), 2);

        // Least loaded in-reserve server comes out first.
        assert_eq!(bunch.get_server_from_reserve(), Some(2));
        assert_eq!(bunch.in_use_count(), 3);
        assert_eq!(bunch.get_server_from_reserve(), Some(0));
        assert_eq!(bunch.get_server_from_reserve(), None);

        // Most recently pulled goes back first.
        assert_eq!(bunch.next_server_to_return(), Some(&0));
        assert!(bunch.return_server_into_reserve(&0));
        assert_eq!(bunch.next_server_to_return(), Some(&2));
        assert_eq!(bunch.reserved_count(), 2);
        assert_eq!(bunch.in_use_count(), 3);

        // Not a reserved server.
        assert!(!bunch.return_server_into_reserve(&1));
    }

    #[test]
    fn removing_active_server_promotes_from_reserve() {
        let mut bunch = bunch_with(0.2, &[Level::Level1; 6]);
        assert_eq!(bunch.reserved_count(), 2);

        let removal = bunch.remove_server(&1).unwrap();
        assert_eq!(*removal.record.handle(), 1);
        assert_eq!(removal.taken_from_reserve, Some(0));
        assert_eq!(bunch.reserved_count(), 1);
        assert!(bunch.get(&0).unwrap().is_in_use());
    }

    #[test]
    fn removing_reserve_server_promotes_nothing() {
        let mut bunch = bunch_with(0.2, &[Level::Level1; 6]);
        let removal = bunch.remove_server(&5).unwrap();
        assert!(removal.record.is_in_reserve());
        assert_eq!(removal.taken_from_reserve, None);
        assert_eq!(bunch.reserved_count(), 1);
        assert!(bunch.remove_server(&5).is_none());
    }

    #[test]
    fn pulled_reserve_loses_designation_before_held_reserve() {
        let mut bunch = bunch_with(0.2, &[Level::Level1; 6]);
        assert_eq!(bunch.get_server_from_reserve(), Some(0));

        let removal = bunch.remove_server(&1).unwrap();
        assert_eq!(removal.taken_from_reserve, None);
        assert!(!bunch.get(&0).unwrap().is_reserved());
        assert!(bunch.get(&5).unwrap().is_in_reserve());
    }

    #[test]
    fn leaving_rotation_drops_reserve_designation() {
        let mut bunch = bunch_with(0.2, &[Level::Level1; 5]);
        assert!(bunch.get(&0).unwrap().is_in_reserve());

        let promoted = bunch.update_server(&0, Level::Level1, ServerState::Offline).unwrap();
        assert!(promoted.is_empty());
        let record = bunch.get(&0).unwrap();
        assert!(!record.is_reserved() && !record.is_in_use());
        // Four servers in rotation still need one in reserve.
        assert_eq!(bunch.reserved_count(), 1);
        assert!(bunch.get(&4).unwrap().is_in_reserve());
        assert_eq!(bunch.in_use_count(), 3);
    }

    #[test]
    fn returning_to_rotation_rejoins_at_the_back() {
        let mut bunch = bunch_with(0.0, &[Level::Level1; 3]);
        bunch.update_server(&0, Level::Level1, ServerState::OutOfRotation);
        assert_eq!(bunch.in_use_count(), 2);
        bunch.update_server(&0, Level::Level3, ServerState::Normal);

        let order: Vec<u32> = bunch.records().map(|r| *r.handle()).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert_eq!(bunch.in_use_count(), 3);
        assert_eq!(bunch.in_use_workload(), 5);
    }

    #[test]
    fn ratio_change_resizes_reserve() {
        let mut bunch = bunch_with(0.0, &[Level::Level1; 4]);
        assert_eq!(bunch.reserved_count(), 0);

        assert!(bunch.set_reserve_ratio(0.5).is_empty());
        assert_eq!(bunch.in_reserve_count(), 2);

        let promoted = bunch.set_reserve_ratio(0.0);
        assert_eq!(promoted, vec![2, 3]);
        assert_eq!(bunch.in_use_count(), 4);
    }

    #[test]
    fn empty_tier_reads_saturated() {
        let bunch: ServerBunch<u32> = ServerBunch::new(3, 0.0);
        assert_eq!(bunch.in_use_average(), None);
        assert_eq!(bunch.tier_level(), Level::HIGHEST);
    }
}
