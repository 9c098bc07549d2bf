//! Shared types used across fleet crates.

use serde::{Deserialize, Serialize};

/// Operational state reported for a worker server alongside its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Eligible for selection, subject to reserve and tier rules.
    #[default]
    Normal,
    /// Registered and counted, but never selected.
    OutOfRotation,
    /// Not counted anywhere until it reports `Normal` again.
    Offline,
}

impl ServerState {
    pub fn is_normal(self) -> bool {
        self == ServerState::Normal
    }

    pub fn label(self) -> &'static str {
        match self {
            ServerState::Normal => "normal",
            ServerState::OutOfRotation => "out-of-rotation",
            ServerState::Offline => "offline",
        }
    }

    /// Parse a label as printed by [`ServerState::label`]; the snake_case
    /// serde spelling is accepted too.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "normal" => Some(ServerState::Normal),
            "out-of-rotation" | "out_of_rotation" => Some(ServerState::OutOfRotation),
            "offline" => Some(ServerState::Offline),
            _ => None,
        }
    }
}
