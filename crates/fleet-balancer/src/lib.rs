//! fleet-balancer — where new rooms go.
//!
//! # Architecture
//!
//! ```text
//! workload.toml ──► WorkloadWatcher ──► ArcSwap<WorkloadSettings>
//!                                              │ (one snapshot per call)
//!                                              ▼
//! heartbeats ──► LoadBalancer ── tier 0 ─► ServerBunch (in use | reserve)
//!                     │          tier 1 ─► ServerBunch
//!                     │          ...
//!                     └──► try_get_server() ─► weighted pick among admitted tiers
//! ```
//!
//! The balancer is driven from one task at a time (`&mut self` for updates).
//! Selection takes `&self` and reads settings through a lock-free snapshot,
//! so a reload never shows a half-applied weights array.

pub mod balancer;
pub mod bunch;
pub mod error;
pub mod reload;

pub use balancer::{DEFAULT_SERVER_WEIGHT, LoadBalancer, ServerStateView, SettingsHandle};
pub use bunch::{Removal, ServerBunch, ServerRecord};
pub use error::{BalancerError, BalancerResult};
pub use reload::WorkloadWatcher;
