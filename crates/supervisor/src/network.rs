//! Orchestration of whole network instances.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use localnet_events::{Event, EventBus, EventKind, Subscription};
use localnet_health::{Assessment, HealthMonitor, Probe, TcpProbe, assess};
use localnet_process::proc_table::{self, PidState};
use localnet_process::{NodeProcess, ProcessHandle, StopOutcome};
use localnet_snapshot::{Snapshot, SnapshotStore};
use localnet_topology::{
    HealthStatus, InstanceId, InstanceState, NetworkInstance, NodeId, NodeRole, PortSet, Template,
    TopologyManager,
};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::lock;
use crate::reconcile::reconcile;
use crate::supervisor::Supervisor;

const READINESS_POLL: Duration = Duration::from_millis(100);
const SUPERVISOR_POLL: Duration = Duration::from_millis(100);

/// Status of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    /// Node identifier.
    pub id: NodeId,

    /// Role in the network.
    pub role: NodeRole,

    /// Ports owned by the node.
    pub ports: PortSet,

    /// Process id, if a process is recorded.
    pub pid: Option<u32>,

    /// Whether the recorded process is alive and still runs the node.
    pub running: bool,

    /// Last known health.
    pub health: HealthStatus,

    /// Restarts so far.
    pub restarts: u32,
}

/// Status of an instance and its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    /// The instance, including its lifecycle state.
    pub instance: NetworkInstance,

    /// PID of the live session supervising the instance, if any.
    pub supervisor: Option<u32>,

    /// Per-node status in topology order.
    pub nodes: Vec<NodeStatus>,
}

/// Outcome of [`NetworkManager::recover`].
#[derive(Debug, Clone)]
pub struct Recovery {
    /// The instance after recovery.
    pub instance: NetworkInstance,

    /// Nodes whose live process was taken over.
    pub adopted: Vec<NodeId>,

    /// Nodes whose process was stale and got spawned again.
    pub respawned: Vec<NodeId>,
}

struct RunningInstance {
    monitor: Arc<HealthMonitor>,
    supervisor: Arc<Supervisor>,
    tasks: TaskTracker,
    token: CancellationToken,
}

struct Inner {
    bus: EventBus,
    config: SupervisorConfig,
    locks: DashMap<InstanceId, Arc<Mutex<()>>>,
    probe: Arc<dyn Probe>,
    running: DashMap<InstanceId, Arc<RunningInstance>>,
    snapshots: SnapshotStore,
    topology: TopologyManager,
}

/// Starts, stops, monitors and recovers network instances stored under one
/// data directory.
///
/// Lifecycle operations on the same instance are serialized; operations on
/// different instances run independently. Every state transition is
/// persisted, published on the bus and snapshotted.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("root", &self.inner.topology.root())
            .field("running", &self.inner.running.len())
            .finish_non_exhaustive()
    }
}

impl NetworkManager {
    /// Creates a manager over `root`, probing node health over TCP.
    pub fn new(root: impl Into<PathBuf>, config: SupervisorConfig) -> Self {
        Self::with_probe(root, config, Arc::new(TcpProbe))
    }

    /// Creates a manager with a custom health probe.
    pub fn with_probe(
        root: impl Into<PathBuf>,
        config: SupervisorConfig,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let root = root.into();
        Self {
            inner: Arc::new(Inner {
                bus: EventBus::new(),
                config,
                locks: DashMap::new(),
                probe,
                running: DashMap::new(),
                snapshots: SnapshotStore::new(root.clone()),
                topology: TopologyManager::new(root),
            }),
        }
    }

    /// Event bus every lifecycle and health event is published on.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Subscribes to every event from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    /// Topology store.
    #[must_use]
    pub fn topology(&self) -> &TopologyManager {
        &self.inner.topology
    }

    /// Snapshot store.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.inner.snapshots
    }

    /// Whether this session supervises `id`.
    #[must_use]
    pub fn is_supervised(&self, id: &InstanceId) -> bool {
        self.inner.running.contains_key(id)
    }

    /// Provisions an instance from `template` without starting it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a bad template or an active
    /// instance, or an IO error.
    pub async fn provision(&self, template: &Template) -> Result<NetworkInstance> {
        let id = template.check()?;
        let _guard = self.inner.lock(&id).await;
        Ok(self.inner.topology.provision(template)?)
    }

    /// Provisions an instance from `template`, starts every node and waits
    /// for readiness.
    ///
    /// Returns once the instance is `Running`, or `Degraded` if it did not
    /// become ready within the readiness timeout.
    ///
    /// # Errors
    ///
    /// Returns the provisioning error, the spawn error that moved the
    /// instance to `Failed`, or [`Error::Unhealthy`] if a majority of
    /// validators became unreachable before the instance was ready.
    pub async fn start(&self, template: &Template) -> Result<NetworkInstance> {
        let id = template.check()?;
        let _guard = self.inner.lock(&id).await;

        if self.inner.running.contains_key(&id) {
            info!(instance = %id, "Instance is already running");
            return Ok(self.inner.topology.load(&id)?);
        }

        match self.inner.settle(&id).await {
            Ok(_) | Err(Error::Topology(localnet_topology::Error::NotFound(_))) => {}
            Err(e) => return Err(e),
        }

        let instance = self.inner.topology.provision(template)?;
        self.inner.launch(instance).await
    }

    /// Starts an already provisioned instance.
    ///
    /// # Errors
    ///
    /// Same as [`Self::start`], plus [`Error::AlreadySupervised`] if another
    /// live session runs the instance.
    pub async fn start_instance(&self, id: &InstanceId) -> Result<NetworkInstance> {
        let _guard = self.inner.lock(id).await;

        if self.inner.running.contains_key(id) {
            info!(instance = %id, "Instance is already running");
            return Ok(self.inner.topology.load(id)?);
        }

        let instance = self.inner.settle(id).await?;
        self.inner.topology.validate(&instance)?;
        self.inner.launch(instance).await
    }

    /// Stops every node of an instance in reverse start order and moves it
    /// to `Stopped`.
    ///
    /// An instance supervised by another live session is stopped by asking
    /// that session to shut down. Stopping an instance with nothing running
    /// returns [`StopOutcome::Ack`].
    ///
    /// # Errors
    ///
    /// Returns the first error hit while signalling a process; the instance
    /// ends up `Failed` in that case.
    pub async fn stop(&self, id: &InstanceId) -> Result<StopOutcome> {
        let _guard = self.inner.lock(id).await;
        self.inner.stop(id).await
    }

    /// Stops every instance supervised by this session.
    ///
    /// # Errors
    ///
    /// Returns the first stop error; every instance is attempted.
    pub async fn shutdown(&self) -> Result<StopOutcome> {
        let ids: Vec<InstanceId> = self.inner.running.iter().map(|e| e.key().clone()).collect();
        info!("Shutting down {} instance(s)", ids.len());

        let mut outcome = StopOutcome::Ack;
        let mut first_error = None;
        for id in &ids {
            match self.stop(id).await {
                Ok(stopped) => outcome = outcome.merge(stopped),
                Err(e) => {
                    error!(instance = %id, "Failed to stop instance: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(outcome), Err)
    }

    /// Stops supervising an instance while leaving its processes running.
    ///
    /// The snapshot records no supervisor, so a later session can
    /// [`recover`](Self::recover) or [`stop`](Self::stop) it.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub async fn detach(&self, id: &InstanceId) -> Result<()> {
        let _guard = self.inner.lock(id).await;

        let Some((_, running)) = self.inner.running.remove(id) else {
            return Ok(());
        };

        running.token.cancel();
        let handles = running.supervisor.handles();
        running.supervisor.forget();
        running.tasks.close();
        running.tasks.wait().await;

        let instance = self.inner.topology.load(id)?;
        self.inner.snapshots.save_detached(&instance, &handles).await?;

        info!(instance = %id, "Detached; {} process(es) left running", handles.len());
        Ok(())
    }

    /// Takes over an instance left behind by an earlier session.
    ///
    /// Live processes recorded in the snapshot are adopted; dead or recycled
    /// PIDs are reported as stale and their nodes spawned again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Snapshot`] if the snapshot is missing or corrupt,
    /// [`Error::AlreadySupervised`] if another live session supervises the
    /// instance, or the spawn error that moved the instance to `Failed`.
    pub async fn recover(&self, id: &InstanceId) -> Result<Recovery> {
        let _guard = self.inner.lock(id).await;
        self.inner.recover(id).await
    }

    /// Stops and re-spawns one node of an instance supervised here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] if this session does not supervise the
    /// instance, [`Error::UnknownNode`] for a node outside it, or the
    /// stop/spawn error.
    pub async fn restart_node(&self, id: &InstanceId, node: &NodeId) -> Result<ProcessHandle> {
        let _guard = self.inner.lock(id).await;

        let running = self
            .inner
            .running(id)
            .ok_or_else(|| Error::NotRunning(id.clone()))?;
        let instance = self.inner.topology.load(id)?;
        let config = instance.node(node).ok_or_else(|| Error::UnknownNode {
            instance: id.clone(),
            node: node.clone(),
        })?;

        running.monitor.reset(node);
        let handle = running.supervisor.restart(config).await?;
        self.inner
            .snapshots
            .save(&instance, &running.supervisor.handles())
            .await?;

        Ok(handle)
    }

    /// Current status of an instance, whether supervised here, by another
    /// session, or by nobody.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Topology`] for an unknown instance, or a snapshot
    /// error if the snapshot is corrupt.
    pub async fn status(&self, id: &InstanceId) -> Result<NetworkStatus> {
        if let Some(running) = self.inner.running(id) {
            let instance = self.inner.topology.load(id)?;
            let nodes = instance
                .nodes()
                .iter()
                .map(|node| {
                    let handle = running.supervisor.handle(&node.id);
                    NodeStatus {
                        id: node.id.clone(),
                        role: node.role,
                        ports: node.ports,
                        pid: handle.as_ref().map(|h| h.pid),
                        running: running.supervisor.is_running(&node.id),
                        health: running.monitor.status(&node.id),
                        restarts: handle.map_or(0, |h| h.restarts),
                    }
                })
                .collect();

            return Ok(NetworkStatus {
                instance,
                supervisor: Some(std::process::id()),
                nodes,
            });
        }

        let instance = self.inner.topology.refresh(id)?;
        let snapshot = self.inner.load_snapshot(id).await?;
        let nodes = instance
            .nodes()
            .iter()
            .map(|node| {
                let handle = snapshot.as_ref().and_then(|s| s.process(&node.id));
                NodeStatus {
                    id: node.id.clone(),
                    role: node.role,
                    ports: node.ports,
                    pid: handle.map(|h| h.pid),
                    running: handle.is_some_and(|h| {
                        proc_table::check(h.pid, &h.command_line) == PidState::Live
                    }),
                    health: handle.map_or(HealthStatus::Unknown, |h| h.health),
                    restarts: handle.map_or(0, |h| h.restarts),
                }
            })
            .collect();

        Ok(NetworkStatus {
            instance,
            supervisor: foreign_supervisor(snapshot.as_ref()),
            nodes,
        })
    }

    /// Every provisioned instance, as persisted.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the data directory cannot be read, or a
    /// topology error for an unreadable instance.
    pub fn list(&self) -> Result<Vec<NetworkInstance>> {
        self.inner
            .topology
            .list()?
            .iter()
            .map(|id| {
                let instance = if self.inner.running.contains_key(id) {
                    self.inner.topology.load(id)?
                } else {
                    self.inner.topology.refresh(id)?
                };
                Ok(instance)
            })
            .collect()
    }

    /// Wipes chain data and logs of a stopped instance.
    ///
    /// # Errors
    ///
    /// Returns a configuration error while the instance is active.
    pub async fn reset(&self, id: &InstanceId) -> Result<NetworkInstance> {
        let _guard = self.inner.lock(id).await;

        let instance = self.inner.topology.reset(id)?;
        self.inner.snapshots.delete(id).await?;
        Ok(instance)
    }

    /// Removes a stopped instance entirely.
    ///
    /// # Errors
    ///
    /// Returns a configuration error while the instance is active.
    pub async fn delete(&self, id: &InstanceId) -> Result<()> {
        {
            let _guard = self.inner.lock(id).await;
            self.inner.topology.delete(id)?;
        }
        self.inner.locks.remove(id);
        Ok(())
    }
}

/// PID of a live supervisor other than this process, from a snapshot.
fn foreign_supervisor(snapshot: Option<&Snapshot>) -> Option<u32> {
    snapshot
        .and_then(|s| s.supervisor_pid)
        .filter(|pid| *pid != std::process::id() && proc_table::is_alive(*pid))
}

impl Inner {
    async fn lock(&self, id: &InstanceId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        lock.lock_owned().await
    }

    fn running(&self, id: &InstanceId) -> Option<Arc<RunningInstance>> {
        self.running.get(id).map(|entry| Arc::clone(entry.value()))
    }

    async fn load_snapshot(&self, id: &InstanceId) -> Result<Option<Snapshot>> {
        match self.snapshots.load(id).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(localnet_snapshot::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves an instance to `next`, then publishes and snapshots the change.
    async fn transition(
        &self,
        id: &InstanceId,
        next: InstanceState,
        processes: &[ProcessHandle],
    ) -> Result<NetworkInstance> {
        let from = self.topology.load(id)?.state();
        let instance = self.topology.transition(id, next)?;

        if from != next {
            info!(instance = %id, "Instance {} -> {}", from, next);
            self.bus.publish(Event::new(
                id.clone(),
                EventKind::InstanceStateChanged { from, to: next },
            ));
        }

        self.snapshots.save(&instance, processes).await?;
        Ok(instance)
    }

    /// Reloads an instance, cleaning up after a session that left it active
    /// and is gone.
    async fn settle(&self, id: &InstanceId) -> Result<NetworkInstance> {
        let instance = self.topology.refresh(id)?;
        if !instance.state().is_active() {
            return Ok(instance);
        }

        let snapshot = self.load_snapshot(id).await?;
        if let Some(pid) = foreign_supervisor(snapshot.as_ref()) {
            return Err(Error::AlreadySupervised {
                instance: id.clone(),
                pid,
            });
        }

        warn!(
            instance = %id,
            "Instance was left {} by an earlier session, cleaning up",
            instance.state()
        );
        self.stop_unsupervised(&instance, snapshot.as_ref()).await?;
        Ok(self.topology.load(id)?)
    }

    fn register(self: &Arc<Self>, id: &InstanceId) -> Arc<RunningInstance> {
        let running = Arc::new(RunningInstance {
            monitor: Arc::new(HealthMonitor::new(
                id.clone(),
                self.config.monitor,
                Arc::clone(&self.probe),
                self.bus.clone(),
            )),
            supervisor: Arc::new(Supervisor::new(id.clone(), self.config, self.bus.clone())),
            tasks: TaskTracker::new(),
            token: CancellationToken::new(),
        });

        self.spawn_evaluator(id, &running);
        self.running.insert(id.clone(), Arc::clone(&running));
        running
    }

    /// Moves an instance to `Starting` and takes the lock file.
    async fn begin(&self, instance: &NetworkInstance, processes: &[ProcessHandle]) -> Result<()> {
        let id = instance.id();
        self.transition(id, InstanceState::Starting, processes).await?;

        if let Err(e) = lock::acquire(instance) {
            self.transition(id, InstanceState::Failed, processes).await?;
            return Err(e);
        }
        Ok(())
    }

    /// Spawns every node in topology order, then waits for readiness.
    async fn launch(self: &Arc<Self>, instance: NetworkInstance) -> Result<NetworkInstance> {
        let id = instance.id().clone();

        self.begin(&instance, &[]).await?;

        let running = self.register(&id);
        for node in instance.nodes() {
            if let Err(e) = running.supervisor.spawn(node).await {
                error!(instance = %id, node = %node.id, "Startup failed: {}", e);
                if let Err(teardown) = self.teardown(&id, &running, InstanceState::Failed).await {
                    warn!(instance = %id, "Teardown after failed startup: {}", teardown);
                }
                return Err(e);
            }

            running
                .monitor
                .watch(node.clone(), running.token.child_token(), &running.tasks);

            let current = self.topology.load(&id)?;
            self.snapshots
                .save(&current, &running.supervisor.handles())
                .await?;
        }

        self.await_readiness(&id, &running).await
    }

    /// Polls the assessment until the instance is ready or the readiness
    /// timeout passes, then moves it out of `Starting`.
    ///
    /// Losing a majority of validators while waiting tears the instance down
    /// to `Failed`.
    async fn await_readiness(
        &self,
        id: &InstanceId,
        running: &RunningInstance,
    ) -> Result<NetworkInstance> {
        let instance = self.topology.load(id)?;
        let deadline = Instant::now() + self.config.readiness_timeout;

        let ready = loop {
            match assess(&instance, |node| running.monitor.status(node)) {
                Assessment::Ready => break true,
                Assessment::Failed => {
                    error!(instance = %id, "Validators became unreachable during startup");
                    self.teardown(id, running, InstanceState::Failed).await?;
                    return Err(Error::Unhealthy(id.clone()));
                }
                Assessment::Pending | Assessment::Degraded => {}
            }
            if Instant::now() >= deadline {
                break false;
            }

            tokio::select! {
                () = running.token.cancelled() => return Ok(self.topology.load(id)?),
                () = tokio::time::sleep(READINESS_POLL) => {}
            }
        };

        let next = if ready {
            InstanceState::Running
        } else {
            warn!(
                instance = %id,
                "Not ready after {:?}",
                self.config.readiness_timeout
            );
            InstanceState::Degraded
        };

        self.transition(id, next, &running.supervisor.handles()).await
    }

    /// Reacts to node events: exits mark the node unreachable, health
    /// changes re-assess the instance.
    fn spawn_evaluator(self: &Arc<Self>, id: &InstanceId, running: &Arc<RunningInstance>) {
        let inner = Arc::clone(self);
        let id = id.clone();
        let running = Arc::clone(running);
        let token = running.token.clone();
        let tasks = running.tasks.clone();
        let mut events = Box::pin(self.bus.subscribe_instance(id.clone()));

        tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let Some(node) = event.node else {
                    continue;
                };

                match event.kind {
                    EventKind::Exited { .. } => {
                        running.monitor.mark_unreachable(&node);
                    }
                    EventKind::HealthChanged { to, .. } => {
                        running.supervisor.set_health(&node, to);
                        if let Err(e) = inner.evaluate(&id, &running).await {
                            warn!(instance = %id, "Failed to evaluate health: {}", e);
                        }
                    }
                    _ => {}
                }
            }

            debug!(instance = %id, "Evaluator stopped");
        });
    }

    async fn evaluate(&self, id: &InstanceId, running: &RunningInstance) -> Result<()> {
        let _guard = tokio::select! {
            () = running.token.cancelled() => return Ok(()),
            guard = self.lock(id) => guard,
        };

        if running.token.is_cancelled() {
            return Ok(());
        }

        let instance = self.topology.load(id)?;
        let handles = running.supervisor.handles();
        if !matches!(
            instance.state(),
            InstanceState::Running | InstanceState::Degraded
        ) {
            return Ok(());
        }

        let next = match assess(&instance, |node| running.monitor.status(node)) {
            Assessment::Ready => InstanceState::Running,
            Assessment::Pending | Assessment::Degraded => InstanceState::Degraded,
            Assessment::Failed => InstanceState::Failed,
        };

        if next == InstanceState::Failed {
            error!(instance = %id, "A majority of validators is unreachable");
            self.teardown(id, running, InstanceState::Failed).await?;
        } else if next == instance.state() {
            self.snapshots.save(&instance, &handles).await?;
        } else {
            self.transition(id, next, &handles).await?;
        }

        Ok(())
    }

    /// Stops every process of a supervised instance and moves it to `state`.
    async fn teardown(
        &self,
        id: &InstanceId,
        running: &RunningInstance,
        state: InstanceState,
    ) -> Result<StopOutcome> {
        running.token.cancel();

        let instance = self.topology.load(id)?;
        let order: Vec<NodeId> = instance.nodes().iter().rev().map(|n| n.id.clone()).collect();
        let stopped = running
            .supervisor
            .stop_all(&order, self.config.stop_timeout)
            .await;

        running.supervisor.forget();
        self.running.remove(id);

        match stopped {
            Ok(outcome) => {
                self.transition(id, state, &[]).await?;
                lock::release(&instance)?;
                Ok(outcome)
            }
            Err(e) => {
                error!(instance = %id, "Failed to stop every node: {}", e);
                self.transition(id, InstanceState::Failed, &[]).await?;
                Err(e)
            }
        }
    }

    async fn stop(&self, id: &InstanceId) -> Result<StopOutcome> {
        if let Some(running) = self.running(id) {
            if self.topology.load(id)?.state() != InstanceState::Failed {
                self.transition(id, InstanceState::Stopping, &running.supervisor.handles())
                    .await?;
            }
            let outcome = self.teardown(id, &running, InstanceState::Stopped).await?;

            running.tasks.close();
            running.tasks.wait().await;
            return Ok(outcome);
        }

        let instance = self.topology.refresh(id)?;
        let mut snapshot = self.load_snapshot(id).await?;

        if let Some(pid) = foreign_supervisor(snapshot.as_ref()) {
            self.signal_supervisor(&instance, pid).await;

            let instance = self.topology.refresh(id)?;
            if !instance.state().is_active() {
                return Ok(StopOutcome::Ack);
            }
            snapshot = self.load_snapshot(id).await?;
        }

        let instance = self.topology.load(id)?;
        self.stop_unsupervised(&instance, snapshot.as_ref()).await
    }

    /// Asks a live supervisor session to shut down and waits for it to exit.
    async fn signal_supervisor(&self, instance: &NetworkInstance, pid: u32) {
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };

        info!(instance = %instance.id(), pid, "Asking supervisor to stop");
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            warn!(instance = %instance.id(), pid, "Failed to signal supervisor: {}", e);
            return;
        }

        let nodes = u32::try_from(instance.nodes().len()).unwrap_or(u32::MAX);
        let budget = self
            .config
            .stop_timeout
            .checked_mul(nodes.saturating_add(1))
            .unwrap_or(Duration::MAX);
        let deadline = Instant::now() + budget;
        while proc_table::is_alive(pid) {
            if Instant::now() >= deadline {
                warn!(instance = %instance.id(), pid, "Supervisor did not exit in time");
                return;
            }
            tokio::time::sleep(SUPERVISOR_POLL).await;
        }
    }

    /// Stops processes recorded in a snapshot with no live supervisor.
    async fn stop_unsupervised(
        &self,
        instance: &NetworkInstance,
        snapshot: Option<&Snapshot>,
    ) -> Result<StopOutcome> {
        let id = instance.id();
        let live: Vec<ProcessHandle> = snapshot
            .map(|s| s.processes.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|h| proc_table::check(h.pid, &h.command_line) == PidState::Live)
            .collect();

        let state = instance.state();
        let tracked = state.is_active() || state == InstanceState::Failed;
        if !tracked && live.is_empty() {
            return Ok(StopOutcome::Ack);
        }

        if tracked {
            self.transition(id, InstanceState::Stopping, &live).await?;
        }

        let mut outcome = StopOutcome::Ack;
        for handle in live.iter().rev() {
            let process = NodeProcess::adopt(handle.node.clone(), handle.pid);
            let stopped = match process.stop(self.config.stop_timeout).await {
                Ok(stopped) => stopped,
                Err(e) => {
                    error!(instance = %id, node = %handle.node, "Failed to stop process: {}", e);
                    if tracked {
                        self.transition(id, InstanceState::Failed, &live).await?;
                    }
                    return Err(e.into());
                }
            };

            info!(instance = %id, node = %handle.node, ?stopped, "Node stopped");
            self.bus.publish(Event::for_node(
                id.clone(),
                handle.node.clone(),
                EventKind::Stopped {
                    forced: stopped == StopOutcome::ForceKillApplied,
                },
            ));
            outcome = outcome.merge(stopped);
        }

        if tracked {
            self.transition(id, InstanceState::Stopped, &[]).await?;
        } else {
            self.snapshots.save(instance, &[]).await?;
        }
        lock::release(instance)?;

        Ok(outcome)
    }

    async fn recover(self: &Arc<Self>, id: &InstanceId) -> Result<Recovery> {
        if self.running.contains_key(id) {
            return Ok(Recovery {
                instance: self.topology.load(id)?,
                adopted: Vec::new(),
                respawned: Vec::new(),
            });
        }

        let mut instance = self.topology.refresh(id)?;
        let mut snapshot = self.snapshots.load(id).await?;
        if let Some(pid) = foreign_supervisor(Some(&snapshot)) {
            return Err(Error::AlreadySupervised {
                instance: id.clone(),
                pid,
            });
        }
        self.topology.validate(&instance)?;

        if instance.state() == InstanceState::Stopping {
            warn!(
                instance = %id,
                "Instance was left stopping by an earlier session, finishing the stop"
            );
            self.stop_unsupervised(&instance, Some(&snapshot)).await?;
            instance = self.topology.load(id)?;
            snapshot = self.snapshots.load(id).await?;
        }

        let reconciliation = reconcile(&instance, &snapshot);
        info!(
            instance = %id,
            live = reconciliation.live.len(),
            stale = reconciliation.stale.len(),
            "Recovering instance"
        );

        if matches!(
            instance.state(),
            InstanceState::Starting | InstanceState::Running | InstanceState::Degraded
        ) {
            lock::acquire(&instance)?;
        } else {
            self.begin(&instance, &reconciliation.live).await?;
        }

        let running = self.register(id);

        let mut adopted = Vec::new();
        for handle in reconciliation.live {
            adopted.push(handle.node.clone());
            running.supervisor.adopt(handle);
        }

        let mut respawned = Vec::new();
        for stale in reconciliation.stale {
            if let Some(pid) = stale.pid {
                self.bus.publish(Event::for_node(
                    id.clone(),
                    stale.node.clone(),
                    EventKind::Stale { pid },
                ));
            }

            let Some(node) = instance.node(&stale.node) else {
                continue;
            };
            if let Err(e) = running.supervisor.respawn(node, stale.restarts).await {
                error!(instance = %id, node = %node.id, "Re-spawn failed: {}", e);
                if let Err(teardown) = self.teardown(id, &running, InstanceState::Failed).await {
                    warn!(instance = %id, "Teardown after failed recovery: {}", teardown);
                }
                return Err(e);
            }
            respawned.push(stale.node);
        }

        for node in instance.nodes() {
            running
                .monitor
                .watch(node.clone(), running.token.child_token(), &running.tasks);
        }

        let current = self.topology.load(id)?;
        self.snapshots
            .save(&current, &running.supervisor.handles())
            .await?;

        let instance = if current.state() == InstanceState::Starting {
            self.await_readiness(id, &running).await?
        } else {
            current
        };

        Ok(Recovery {
            instance,
            adopted,
            respawned,
        })
    }
}
