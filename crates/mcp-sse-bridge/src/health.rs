//! Health status types for the bridge.

use serde::{Deserialize, Serialize};

/// Liveness of the child process as reported over HTTP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Child attached and running
    Healthy,
    /// No child, child exited, or shutting down
    #[default]
    Unhealthy,
}

impl Health {
    pub fn from_alive(alive: bool) -> Self {
        if alive {
            Health::Healthy
        } else {
            Health::Unhealthy
        }
    }

    pub fn is_healthy(self) -> bool {
        self == Health::Healthy
    }
}
