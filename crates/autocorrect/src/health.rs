//! Health status types for the lookup service.

use serde::{Deserialize, Serialize};

/// Health of the suggestion pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Just created, nothing spawned yet
    #[default]
    Unknown,
    /// Spawning the process and waiting for readiness
    Starting,
    /// Accepting lookups
    Ready,
    /// Process lost, respawn pending; lookups fail fast
    Restarting,
    /// Restart limit reached
    Defunct,
    /// Shut down
    Stopped,
}

impl Health {
    /// Whether lookups can currently reach the process.
    pub fn accepts_lookups(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// The live suggestion process, as reported by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the process was spawned (RFC 3339).
    pub started_at: String,
    /// Restarts since the service started.
    pub restarts: u32,
}
