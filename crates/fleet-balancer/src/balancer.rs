//! Priority-tiered weighted load balancer.
//!
//! Servers are grouped into [`ServerBunch`] tiers keyed by priority (lower
//! is preferred). Tier 0 always exists; other tiers are created on first use
//! and kept once created. Capacity is released in two stages:
//!
//! 1. inside a tier, a busy tier pulls servers out of its reserve and a quiet
//!    tier puts them back;
//! 2. across tiers, a saturated top tier admits the next priority into the
//!    selection pool, and a quiet tier below the top excludes the top again.
//!
//! Selection draws among servers in use in the admitted tiers, each weighted
//! by `weights[level] * server_weight`. Settings sit behind an `ArcSwap`, so
//! a reload publishes a complete new value and every call works from a
//! single snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use fleet_core::{Level, LEVELS_COUNT, ServerState, WorkloadSettings};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::bunch::{ServerBunch, ServerRecord};
use crate::error::{BalancerError, BalancerResult};

/// Shared, hot-swappable balancer settings.
pub type SettingsHandle = Arc<ArcSwap<WorkloadSettings>>;

/// Selection weight multiplier for servers added without one.
pub const DEFAULT_SERVER_WEIGHT: u32 = 1;

/// Diagnostic view of one registered server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStateView<T> {
    pub handle: T,
    pub level: Level,
    pub priority: u8,
    pub weight: u32,
    pub state: ServerState,
    pub is_reserved: bool,
    pub is_in_reserve: bool,
}

pub struct LoadBalancer<T> {
    bunches: BTreeMap<u8, ServerBunch<T>>,
    priorities: HashMap<T, u8>,
    settings: SettingsHandle,
    admitted_priority: u8,
}

impl<T: Clone + Eq + Hash + Debug> LoadBalancer<T> {
    /// Build a balancer with fixed settings. Tier 0 exists from the start.
    pub fn new(settings: WorkloadSettings) -> Self {
        Self::with_settings_handle(Arc::new(ArcSwap::from_pointee(settings)))
    }

    /// Build a balancer reading its settings from a shared handle, typically
    /// one a `WorkloadWatcher` publishes into.
    pub fn with_settings_handle(settings: SettingsHandle) -> Self {
        let ratio = settings.load().reserve_ratio;
        let mut bunches = BTreeMap::new();
        bunches.insert(0, ServerBunch::new(0, ratio));
        Self {
            bunches,
            priorities: HashMap::new(),
            settings,
            admitted_priority: 0,
        }
    }

    /// Handle to publish replacement settings through.
    pub fn settings_handle(&self) -> SettingsHandle {
        self.settings.clone()
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<WorkloadSettings> {
        self.settings.load_full()
    }

    /// Copy of the weights array currently in effect.
    pub fn weights_snapshot(&self) -> [u32; LEVELS_COUNT] {
        self.settings.load().weights
    }

    /// Highest priority whose servers are currently selectable.
    pub fn admitted_priority(&self) -> u8 {
        self.admitted_priority
    }

    /// Number of registered servers across all tiers.
    pub fn len(&self) -> usize {
        self.priorities.len()
    }

    /// Whether no server is registered.
    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }

    /// Whether `handle` is registered.
    pub fn contains(&self, handle: &T) -> bool {
        self.priorities.contains_key(handle)
    }

    /// Tier a registered server belongs to.
    pub fn priority_of(&self, handle: &T) -> Option<u8> {
        self.priorities.get(handle).copied()
    }

    /// The tier for `priority`, if it has been created.
    pub fn bunch(&self, priority: u8) -> Option<&ServerBunch<T>> {
        self.bunches.get(&priority)
    }

    /// Priorities of every tier created so far, ascending.
    pub fn priorities(&self) -> impl Iterator<Item = u8> + '_ {
        self.bunches.keys().copied()
    }

    /// Register a server with the default weight.
    pub fn try_add_server(&mut self, handle: T, level: Level, priority: u8) -> BalancerResult<()> {
        self.try_add_server_weighted(handle, level, priority, DEFAULT_SERVER_WEIGHT)
    }

    /// Register a server in the tier for `priority`, creating the tier if
    /// needed.
    pub fn try_add_server_weighted(
        &mut self,
        handle: T,
        level: Level,
        priority: u8,
        weight: u32,
    ) -> BalancerResult<()> {
        if self.priorities.contains_key(&handle) {
            return Err(BalancerError::DuplicateServer(format!("{handle:?}")));
        }

        let bunch = self.bunch_entry(priority);
        if !bunch.try_add_server(handle.clone(), level, weight) {
            return Err(BalancerError::DuplicateServer(format!("{handle:?}")));
        }
        info!(server = ?handle, %level, priority, weight, "server added");
        self.priorities.insert(handle, priority);

        self.evaluate(&[priority]);
        Ok(())
    }

    /// Update a server's level, priority and rotation state.
    ///
    /// A priority change moves the server to the other tier, keeping its
    /// weight. `OutOfRotation` and `Offline` take it out of selection at
    /// once; `Normal` brings it back under the same reserve rules as a new
    /// server.
    pub fn try_update_server(
        &mut self,
        handle: &T,
        level: Level,
        priority: u8,
        state: ServerState,
    ) -> BalancerResult<()> {
        let current = self
            .priority_of(handle)
            .ok_or_else(|| BalancerError::UnknownServer(format!("{handle:?}")))?;

        if current == priority {
            let bunch = self
                .bunches
                .get_mut(&current)
                .ok_or_else(|| BalancerError::UnknownServer(format!("{handle:?}")))?;
            let promoted = bunch
                .update_server(handle, level, state)
                .ok_or_else(|| BalancerError::UnknownServer(format!("{handle:?}")))?;
            for server in promoted {
                info!(priority, server = ?server, "server taken from reserve");
            }
            debug!(server = ?handle, %level, priority, state = state.label(), "server updated");
            self.evaluate(&[priority]);
            return Ok(());
        }

        let removal = self
            .bunches
            .get_mut(&current)
            .and_then(|bunch| bunch.remove_server(handle))
            .ok_or_else(|| BalancerError::UnknownServer(format!("{handle:?}")))?;
        if let Some(server) = &removal.taken_from_reserve {
            info!(priority = current, server = ?server, "server taken from reserve");
        }

        let weight = removal.record.weight();
        self.bunch_entry(priority)
            .try_add_server_with_state(handle.clone(), level, weight, state);
        self.priorities.insert(handle.clone(), priority);
        info!(server = ?handle, from = current, to = priority, %level, state = state.label(), "server moved between tiers");

        self.evaluate(&[current, priority]);
        Ok(())
    }

    /// Unregister a server. When `priority` is given it must match the
    /// server's tier.
    pub fn try_remove_server(&mut self, handle: &T, priority: Option<u8>) -> BalancerResult<()> {
        let actual = self
            .priority_of(handle)
            .ok_or_else(|| BalancerError::UnknownServer(format!("{handle:?}")))?;
        match priority {
            Some(expected) if expected != actual => {
                return Err(BalancerError::PriorityMismatch {
                    server: format!("{handle:?}"),
                    expected,
                    actual,
                });
            }
            _ => {}
        }

        let removal = self
            .bunches
            .get_mut(&actual)
            .and_then(|bunch| bunch.remove_server(handle))
            .ok_or_else(|| BalancerError::UnknownServer(format!("{handle:?}")))?;
        self.priorities.remove(handle);
        info!(server = ?handle, priority = actual, "server removed");
        if let Some(server) = &removal.taken_from_reserve {
            info!(priority = actual, server = ?server, "server taken from reserve");
        }

        self.evaluate(&[actual]);
        Ok(())
    }

    /// Pick a server, weighted by load level. `None` when nothing eligible
    /// has a non-zero weight.
    pub fn try_get_server(&self) -> Option<T> {
        self.try_get_server_with(&mut rand::rng(), |_| true)
    }

    /// Pick a server among those accepted by `filter`.
    pub fn try_get_server_filtered(&self, filter: impl Fn(&T) -> bool) -> Option<T> {
        self.try_get_server_with(&mut rand::rng(), filter)
    }

    /// Weighted pick with a caller-supplied random source.
    pub fn try_get_server_with<R: Rng>(
        &self,
        rng: &mut R,
        filter: impl Fn(&T) -> bool,
    ) -> Option<T> {
        let settings = self.settings.load();
        let candidates: Vec<(&T, u64)> = self
            .available_records()
            .filter(|(_, record)| filter(record.handle()))
            .map(|(_, record)| (record.handle(), selection_weight(&settings, record)))
            .filter(|(_, weight)| *weight > 0)
            .collect();

        let total: u64 = candidates.iter().map(|(_, weight)| weight).sum();
        if total == 0 {
            trace!(admitted = self.admitted_priority, "no server available");
            return None;
        }

        let mut draw = rng.random_range(0..total);
        for (handle, weight) in candidates {
            if draw < weight {
                return Some(handle.clone());
            }
            draw -= weight;
        }
        None
    }

    /// Every registered server, ordered by priority then arrival.
    pub fn server_states(&self) -> Vec<ServerStateView<T>> {
        self.bunches
            .iter()
            .flat_map(|(priority, bunch)| {
                bunch.records().map(move |record| ServerStateView {
                    handle: record.handle().clone(),
                    level: record.level(),
                    priority: *priority,
                    weight: record.weight(),
                    state: record.state(),
                    is_reserved: record.is_reserved(),
                    is_in_reserve: record.is_in_reserve(),
                })
            })
            .collect()
    }

    /// Sum of level indices over non-offline servers in the admitted tiers.
    pub fn total_workload(&self) -> u64 {
        self.online_records()
            .map(|(_, record)| record.level().index() as u64)
            .sum()
    }

    /// Mean level over non-offline servers in the admitted tiers, weighted
    /// by each server's weight.
    pub fn average_workload(&self) -> Level {
        weighted_average(self.online_records().map(|(_, record)| record))
    }

    /// Mean level over the servers selection could pick right now.
    pub fn average_workload_for_available_servers(&self) -> Level {
        weighted_average(self.available_records().map(|(_, record)| record))
    }

    /// Re-apply the current settings to every tier. Call after publishing
    /// new settings so a changed reserve ratio or threshold takes effect
    /// without waiting for the next server update.
    pub fn refresh(&mut self) {
        let priorities: Vec<u8> = self.bunches.keys().copied().collect();
        self.evaluate(&priorities);
    }

    fn bunch_entry(&mut self, priority: u8) -> &mut ServerBunch<T> {
        let ratio = self.settings.load().reserve_ratio;
        self.bunches.entry(priority).or_insert_with(|| {
            debug!(priority, "priority tier created");
            ServerBunch::new(priority, ratio)
        })
    }

    fn admitted_records(&self) -> impl Iterator<Item = (u8, &ServerRecord<T>)> + '_ {
        self.bunches
            .range(..=self.admitted_priority)
            .flat_map(|(priority, bunch)| bunch.records().map(move |record| (*priority, record)))
    }

    fn online_records(&self) -> impl Iterator<Item = (u8, &ServerRecord<T>)> + '_ {
        self.admitted_records()
            .filter(|(_, record)| record.state() != ServerState::Offline)
    }

    fn available_records(&self) -> impl Iterator<Item = (u8, &ServerRecord<T>)> + '_ {
        self.admitted_records().filter(|(_, record)| record.is_in_use())
    }

    /// Re-run reserve decisions for the touched tiers and the top admitted
    /// tier, then tier admission.
    fn evaluate(&mut self, touched: &[u8]) {
        let settings = self.settings.load_full();

        let mut tiers = touched.to_vec();
        tiers.push(self.admitted_priority);
        tiers.sort_unstable();
        tiers.dedup();
        for priority in tiers {
            if let Some(bunch) = self.bunches.get_mut(&priority) {
                balance_reserve(bunch, &settings);
            }
        }

        self.update_admitted_tiers(&settings);
    }

    fn update_admitted_tiers(&mut self, settings: &WorkloadSettings) {
        let before = self.admitted_priority;

        while let Some(next) = self.next_priority_above(self.admitted_priority) {
            let Some(top) = self.bunches.get(&self.admitted_priority) else {
                break;
            };
            if top.in_reserve_count() > 0 || top.tier_level() < settings.priority_up_threshold {
                break;
            }
            self.admitted_priority = next;
        }

        if self.admitted_priority == before {
            // Tiers with nothing in use were skipped on the way up; judge
            // the nearest tier below that still serves traffic.
            while let Some(below) = self.next_serving_priority_below(self.admitted_priority) {
                let Some(bunch) = self.bunches.get(&below) else {
                    break;
                };
                if bunch.tier_level() >= settings.priority_down_threshold {
                    break;
                }
                self.admitted_priority = below;
            }
        }

        if self.admitted_priority != before {
            info!(from = before, to = self.admitted_priority, "admitted priority changed");
        }
    }

    fn next_priority_above(&self, priority: u8) -> Option<u8> {
        let start = priority.checked_add(1)?;
        self.bunches.range(start..).next().map(|(p, _)| *p)
    }

    fn next_serving_priority_below(&self, priority: u8) -> Option<u8> {
        self.bunches
            .range(..priority)
            .rev()
            .find(|(_, bunch)| bunch.in_use_count() > 0)
            .map(|(p, _)| *p)
    }
}

/// Sync the tier with the current reserve ratio, then release or restore
/// one reserve server depending on the tier's load.
fn balance_reserve<T: Clone + Eq + Debug>(bunch: &mut ServerBunch<T>, settings: &WorkloadSettings) {
    let priority = bunch.priority();
    if bunch.reserve_ratio() != settings.reserve_ratio {
        let promoted = bunch.set_reserve_ratio(settings.reserve_ratio);
        debug!(priority, ratio = settings.reserve_ratio, promoted = promoted.len(), "reserve resized");
    }

    let level = bunch.tier_level();
    if level >= settings.priority_up_threshold {
        if let Some(server) = bunch.get_server_from_reserve() {
            info!(priority, server = ?server, %level, "server taken from reserve");
        }
    } else if level < settings.priority_down_threshold && bunch.in_use_count() > 1 {
        // Never empty a tier by returning its last server in use.
        if let Some(server) = bunch.next_server_to_return().cloned() {
            if bunch.return_server_into_reserve(&server) {
                info!(priority, server = ?server, %level, "server returned to reserve");
            }
        }
    }
}

fn selection_weight<T>(settings: &WorkloadSettings, record: &ServerRecord<T>) -> u64 {
    u64::from(settings.weight(record.level())) * u64::from(record.weight())
}

fn weighted_average<'a, T: 'a>(records: impl Iterator<Item = &'a ServerRecord<T>>) -> Level {
    let (sum, weight) = records.fold((0u64, 0u64), |(sum, weight), record| {
        let w = u64::from(record.weight());
        (sum + record.level().index() as u64 * w, weight + w)
    });
    if weight == 0 {
        return Level::LOWEST;
    }
    Level::from_average(sum as f64 / weight as f64)
}
