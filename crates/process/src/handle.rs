use chrono::{DateTime, Utc};
use localnet_topology::{HealthStatus, NodeId};
use serde::{Deserialize, Serialize};

/// Runtime record of one node process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// Node the process serves.
    pub node: NodeId,

    /// OS process id.
    pub pid: u32,

    /// When the process was spawned.
    pub spawned_at: DateTime<Utc>,

    /// Last observed health.
    #[serde(default)]
    pub health: HealthStatus,

    /// How many times the node was restarted.
    #[serde(default)]
    pub restarts: u32,

    /// Command line the process was spawned with.
    pub command_line: Vec<String>,
}

impl ProcessHandle {
    /// Creates a handle for a freshly spawned process.
    #[must_use]
    pub fn new(node: NodeId, pid: u32, command_line: Vec<String>) -> Self {
        Self {
            node,
            pid,
            spawned_at: Utc::now(),
            health: HealthStatus::Unknown,
            restarts: 0,
            command_line,
        }
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOutcome {
    /// The process exited on SIGTERM, or was not running.
    Ack,

    /// The process ignored SIGTERM and was killed.
    ForceKillApplied,
}

impl StopOutcome {
    /// Combines outcomes of several stops; forced wins.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Ack, Self::Ack) => Self::Ack,
            _ => Self::ForceKillApplied,
        }
    }
}
