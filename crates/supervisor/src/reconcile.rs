//! Matching snapshot PIDs against the live process table.

use localnet_process::proc_table::{self, PidState};
use localnet_process::ProcessHandle;
use localnet_snapshot::Snapshot;
use localnet_topology::{NetworkInstance, NodeId};
use tracing::{debug, warn};

/// A node whose recorded process cannot be adopted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleNode {
    /// Node to re-spawn.
    pub node: NodeId,

    /// Recorded PID, if the snapshot had one.
    pub pid: Option<u32>,

    /// Restarts recorded so far.
    pub restarts: u32,
}

/// Result of reconciling a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Processes still alive and running the node's command line.
    pub live: Vec<ProcessHandle>,

    /// Nodes whose process is dead, recycled or missing.
    pub stale: Vec<StaleNode>,
}

/// Checks every node of `instance` against the processes in `snapshot`.
///
/// A PID is stale when it is dead, or alive but running a different command
/// line than the one observed when it was spawned.
#[must_use]
pub fn reconcile(instance: &NetworkInstance, snapshot: &Snapshot) -> Reconciliation {
    let mut result = Reconciliation::default();

    for node in instance.nodes() {
        let Some(handle) = snapshot.process(&node.id) else {
            debug!(node = %node.id, "No recorded process");
            result.stale.push(StaleNode {
                node: node.id.clone(),
                pid: None,
                restarts: 0,
            });
            continue;
        };

        match proc_table::check(handle.pid, &handle.command_line) {
            PidState::Live => result.live.push(handle.clone()),
            state => {
                warn!(node = %node.id, pid = handle.pid, ?state, "Recorded process is stale");
                result.stale.push(StaleNode {
                    node: node.id.clone(),
                    pid: Some(handle.pid),
                    restarts: handle.restarts,
                });
            }
        }
    }

    result
}
