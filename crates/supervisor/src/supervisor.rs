//! Per-instance process supervisor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use localnet_events::{Event, EventBus, EventKind};
use localnet_process::{NodeProcess, NodeSpawner, ProcessHandle, StopOutcome, proc_table};
use localnet_topology::{HealthStatus, InstanceId, NodeConfig, NodeId};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::Result;

/// Output flush budget after a process stopped.
const OUTPUT_FLUSH: Duration = Duration::from_millis(500);

struct Managed {
    handle: ProcessHandle,
    process: Arc<NodeProcess>,
    stopping: CancellationToken,
}

/// Owns the processes of one network instance.
///
/// Spawn, stop and restart are serialized; nothing else is. Every lifecycle
/// operation publishes an event, and a process exiting on its own publishes
/// [`EventKind::Exited`].
pub struct Supervisor {
    bus: EventBus,
    config: SupervisorConfig,
    instance: InstanceId,
    lifecycle: Mutex<()>,
    processes: DashMap<NodeId, Managed>,
    spawner: NodeSpawner,
    watchers: TaskTracker,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("instance", &self.instance)
            .field("processes", &self.processes.len())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Creates a supervisor for `instance`.
    #[must_use]
    pub fn new(instance: InstanceId, config: SupervisorConfig, bus: EventBus) -> Self {
        Self {
            bus,
            instance,
            lifecycle: Mutex::new(()),
            processes: DashMap::new(),
            spawner: NodeSpawner::new()
                .with_startup_grace(config.startup_grace)
                .with_output(config.output),
            config,
            watchers: TaskTracker::new(),
        }
    }

    /// Instance supervised.
    #[must_use]
    pub const fn instance(&self) -> &InstanceId {
        &self.instance
    }

    fn publish(&self, node: &NodeId, kind: EventKind) {
        self.bus.publish(Event::for_node(
            self.instance.clone(),
            node.clone(),
            kind,
        ));
    }

    /// Spawns the process of `node`, retrying transient failures with
    /// exponential backoff.
    ///
    /// A node that already has a running process keeps it.
    ///
    /// # Errors
    ///
    /// Returns the last spawn error once retries are exhausted, or the first
    /// permanent one.
    pub async fn spawn(&self, node: &NodeConfig) -> Result<ProcessHandle> {
        let _guard = self.lifecycle.lock().await;
        self.spawn_locked(node, 0).await
    }

    async fn spawn_locked(&self, node: &NodeConfig, restarts: u32) -> Result<ProcessHandle> {
        if let Some(managed) = self.processes.get(&node.id) {
            if managed.process.is_running() {
                return Ok(managed.handle.clone());
            }
        }

        let mut retry = 0;
        let process = loop {
            match self.spawner.spawn(node).await {
                Ok(process) => break process,
                Err(e) if e.is_transient() && retry < self.config.retry.retries => {
                    let delay = self.config.retry.backoff(retry);
                    warn!(node = %node.id, "Spawn failed ({}), retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    error!(node = %node.id, "Spawn failed: {}", e);
                    self.publish(
                        &node.id,
                        EventKind::SpawnFailed {
                            error: e.to_string(),
                        },
                    );
                    return Err(e.into());
                }
            }
        };

        // Shebang scripts run with the interpreter's argv; keep what the kernel reports.
        let command_line =
            proc_table::command_line(process.pid()).unwrap_or_else(|| node.command_line());
        let mut handle = ProcessHandle::new(node.id.clone(), process.pid(), command_line);
        handle.restarts = restarts;

        info!(node = %node.id, pid = handle.pid, "Node started");
        self.track(handle.clone(), process);
        self.publish(&node.id, EventKind::Started { pid: handle.pid });

        Ok(handle)
    }

    /// Takes over a live process recorded by an earlier session.
    ///
    /// The caller must have checked that the PID still runs the node's
    /// command line.
    pub fn adopt(&self, handle: ProcessHandle) -> ProcessHandle {
        let process = NodeProcess::adopt(handle.node.clone(), handle.pid);

        info!(node = %handle.node, pid = handle.pid, "Adopted process");
        self.track(handle.clone(), process);
        self.publish(&handle.node, EventKind::Adopted { pid: handle.pid });

        handle
    }

    fn track(&self, handle: ProcessHandle, process: NodeProcess) {
        let process = Arc::new(process);
        let stopping = CancellationToken::new();

        let watched = Arc::clone(&process);
        let token = stopping.clone();
        let bus = self.bus.clone();
        let instance = self.instance.clone();
        let node = handle.node.clone();
        self.watchers.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                exit = watched.wait() => {
                    warn!(node = %node, "Process exited unexpectedly with {:?}", exit);
                    bus.publish(Event::for_node(
                        instance,
                        node,
                        EventKind::Exited { code: exit.code },
                    ));
                }
            }
        });

        if let Some(previous) = self.processes.insert(
            handle.node.clone(),
            Managed {
                handle,
                process,
                stopping,
            },
        ) {
            previous.stopping.cancel();
        }
    }

    /// Stops the process of `node`: SIGTERM, then SIGKILL after `timeout`.
    ///
    /// Stopping a node without a running process returns
    /// [`StopOutcome::Ack`].
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be signalled; it stays
    /// tracked in that case.
    pub async fn stop(&self, node: &NodeId, timeout: Duration) -> Result<StopOutcome> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(node, timeout).await
    }

    async fn stop_locked(&self, node: &NodeId, timeout: Duration) -> Result<StopOutcome> {
        let Some((_, managed)) = self.processes.remove(node) else {
            return Ok(StopOutcome::Ack);
        };

        managed.stopping.cancel();

        let outcome = match managed.process.stop(timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(node = %node, "Failed to stop process: {}", e);
                self.processes.insert(node.clone(), managed);
                return Err(e.into());
            }
        };

        managed.process.flush_output(OUTPUT_FLUSH).await;

        info!(node = %node, ?outcome, "Node stopped");
        self.publish(
            node,
            EventKind::Stopped {
                forced: outcome == StopOutcome::ForceKillApplied,
            },
        );

        Ok(outcome)
    }

    /// Stops and re-spawns the process of `node`.
    ///
    /// # Errors
    ///
    /// Returns the stop or spawn error.
    pub async fn restart(&self, node: &NodeConfig) -> Result<ProcessHandle> {
        let _guard = self.lifecycle.lock().await;

        let restarts = self
            .processes
            .get(&node.id)
            .map_or(0, |managed| managed.handle.restarts)
            .saturating_add(1);

        self.stop_locked(&node.id, self.config.stop_timeout).await?;
        let handle = self.spawn_locked(node, restarts).await?;

        self.publish(
            &node.id,
            EventKind::Restarted {
                pid: handle.pid,
                restarts,
            },
        );

        Ok(handle)
    }

    /// Stops `order` in sequence, then anything still tracked.
    ///
    /// Every node is attempted; the first error is returned at the end.
    ///
    /// # Errors
    ///
    /// Returns the first stop error.
    pub async fn stop_all(&self, order: &[NodeId], timeout: Duration) -> Result<StopOutcome> {
        let _guard = self.lifecycle.lock().await;

        let mut nodes: Vec<NodeId> = order.to_vec();
        for entry in &self.processes {
            if !nodes.contains(entry.key()) {
                nodes.push(entry.key().clone());
            }
        }

        let mut outcome = StopOutcome::Ack;
        let mut first_error = None;
        for node in &nodes {
            match self.stop_locked(node, timeout).await {
                Ok(stopped) => outcome = outcome.merge(stopped),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(outcome), Err)
    }

    /// Spawns a node whose recorded process turned out stale, carrying its
    /// restart count forward.
    ///
    /// # Errors
    ///
    /// Same as [`Self::spawn`].
    pub async fn respawn(&self, node: &NodeConfig, restarts: u32) -> Result<ProcessHandle> {
        let _guard = self.lifecycle.lock().await;

        let restarts = restarts.saturating_add(1);
        let handle = self.spawn_locked(node, restarts).await?;
        self.publish(
            &node.id,
            EventKind::Restarted {
                pid: handle.pid,
                restarts,
            },
        );

        Ok(handle)
    }

    /// Stops tracking every process without stopping it.
    pub fn forget(&self) {
        for entry in &self.processes {
            entry.stopping.cancel();
        }
        self.processes.clear();
        self.watchers.close();
    }

    /// Handle of a node's process, running or not.
    #[must_use]
    pub fn handle(&self, node: &NodeId) -> Option<ProcessHandle> {
        self.processes.get(node).map(|m| m.handle.clone())
    }

    /// Whether `node` has a running process.
    #[must_use]
    pub fn is_running(&self, node: &NodeId) -> bool {
        self.processes
            .get(node)
            .is_some_and(|m| m.process.is_running())
    }

    /// Handles of every running process.
    #[must_use]
    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.processes
            .iter()
            .filter(|m| m.process.is_running())
            .map(|m| m.handle.clone())
            .collect()
    }

    /// Records the last observed health of a node.
    pub fn set_health(&self, node: &NodeId, health: HealthStatus) {
        if let Some(mut managed) = self.processes.get_mut(node) {
            managed.handle.health = health;
        }
    }
}
