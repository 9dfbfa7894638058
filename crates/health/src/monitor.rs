use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use localnet_events::{Event, EventBus, EventKind};
use localnet_topology::{HealthStatus, InstanceId, NodeConfig, NodeId};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::probe::Probe;
use crate::tracker::HealthTracker;

/// Outcome of one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Node polled.
    pub node: NodeId,

    /// When the poll finished.
    pub at: DateTime<Utc>,

    /// Status after the poll.
    pub status: HealthStatus,

    /// Round-trip time of a successful poll.
    pub latency: Option<Duration>,
}

#[derive(Debug)]
struct NodeHealth {
    history: VecDeque<HealthRecord>,
    tracker: HealthTracker,
}

/// Polls the nodes of one instance and keeps their health history.
///
/// Each node is polled by its own task on its own interval. Status changes
/// are published on the event bus as [`EventKind::HealthChanged`].
pub struct HealthMonitor {
    bus: EventBus,
    config: MonitorConfig,
    instance: InstanceId,
    nodes: DashMap<NodeId, NodeHealth>,
    probe: Arc<dyn Probe>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("instance", &self.instance)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Creates a monitor for `instance`.
    pub fn new(
        instance: InstanceId,
        config: MonitorConfig,
        probe: Arc<dyn Probe>,
        bus: EventBus,
    ) -> Self {
        Self {
            bus,
            config,
            instance,
            nodes: DashMap::new(),
            probe,
        }
    }

    /// Monitor settings.
    #[must_use]
    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Polls `node` once, bounded by the poll timeout, and records the
    /// outcome. Failures are recorded, never returned.
    pub async fn poll(&self, node: &NodeConfig) -> HealthRecord {
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.timeout, self.probe.probe(node)).await;

        let latency = match result {
            Ok(Ok(())) => Some(started.elapsed()),
            Ok(Err(e)) => {
                debug!(node = %node.id, "Health probe failed: {}", e);
                None
            }
            Err(_) => {
                debug!(node = %node.id, "Health probe timed out after {:?}", self.config.timeout);
                None
            }
        };

        self.observe(&node.id, latency)
    }

    /// Records a poll outcome: `Some(latency)` for success.
    pub fn observe(&self, node: &NodeId, latency: Option<Duration>) -> HealthRecord {
        self.update(node, latency, |tracker| tracker.observe(latency.is_some()))
    }

    /// Marks a node unreachable without polling it, e.g. after its process
    /// exited.
    pub fn mark_unreachable(&self, node: &NodeId) -> HealthRecord {
        self.update(node, None, HealthTracker::force_unreachable)
    }

    fn update<F>(&self, node: &NodeId, latency: Option<Duration>, apply: F) -> HealthRecord
    where
        F: FnOnce(&mut HealthTracker) -> HealthStatus,
    {
        // Publish under the entry guard: a node's changes go out in apply order.
        let mut entry = self.nodes.entry(node.clone()).or_insert_with(|| NodeHealth {
            history: VecDeque::new(),
            tracker: HealthTracker::new(self.config.failure_threshold),
        });

        let previous = entry.tracker.status();
        let status = apply(&mut entry.tracker);
        let record = HealthRecord {
            node: node.clone(),
            at: Utc::now(),
            status,
            latency,
        };

        entry.history.push_back(record.clone());
        while entry.history.len() > self.config.history.max(1) {
            entry.history.pop_front();
        }

        if previous != record.status {
            match record.status {
                HealthStatus::Healthy => info!(node = %node, "Node is healthy"),
                HealthStatus::Unreachable => warn!(node = %node, "Node is unreachable"),
                _ => debug!(node = %node, "Node health {} -> {}", previous, record.status),
            }

            self.bus.publish(Event::for_node(
                self.instance.clone(),
                node.clone(),
                EventKind::HealthChanged {
                    from: previous,
                    to: record.status,
                },
            ));
        }
        drop(entry);

        record
    }

    /// Forgets a node's state, e.g. after its process was respawned.
    pub fn reset(&self, node: &NodeId) {
        if let Some(mut entry) = self.nodes.get_mut(node) {
            entry.tracker.reset();
        }
    }

    /// Current status of a node; `Unknown` if never polled.
    #[must_use]
    pub fn status(&self, node: &NodeId) -> HealthStatus {
        self.nodes
            .get(node)
            .map_or(HealthStatus::Unknown, |entry| entry.tracker.status())
    }

    /// Current status of every polled node.
    #[must_use]
    pub fn statuses(&self) -> HashMap<NodeId, HealthStatus> {
        self.nodes
            .iter()
            .map(|entry| (entry.key().clone(), entry.tracker.status()))
            .collect()
    }

    /// Recorded history of a node, oldest first.
    #[must_use]
    pub fn history(&self, node: &NodeId) -> Vec<HealthRecord> {
        self.nodes
            .get(node)
            .map(|entry| entry.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Starts the polling task of one node on `tracker`.
    ///
    /// The task stops when `token` is cancelled, abandoning an in-flight
    /// poll.
    pub fn watch(self: &Arc<Self>, node: NodeConfig, token: CancellationToken, tracker: &TaskTracker) {
        let monitor = Arc::clone(self);
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                tokio::select! {
                    () = token.cancelled() => break,
                    _ = monitor.poll(&node) => {}
                }
            }

            debug!(node = %node.id, "Stopped polling");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{BTreeMap, VecDeque as Script};
    use std::io;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use localnet_topology::{GenesisRef, LaunchCommand, NodeRole, PortSet};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    use crate::probe::TcpProbe;

    /// Probe replaying a fixed sequence of outcomes, then succeeding.
    struct ScriptedProbe(Mutex<Script<bool>>);

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, _node: &NodeConfig) -> io::Result<()> {
            if self.0.lock().pop_front().unwrap_or(true) {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "scripted"))
            }
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl Probe for HangingProbe {
        async fn probe(&self, _node: &NodeConfig) -> io::Result<()> {
            std::future::pending().await
        }
    }

    fn node(health: u16) -> NodeConfig {
        NodeConfig {
            id: NodeId::new("validator-0"),
            role: NodeRole::Validator,
            ports: PortSet {
                p2p: health - 2,
                rpc: health - 1,
                health,
            },
            key: None,
            genesis: GenesisRef {
                path: PathBuf::from("/tmp/genesis.json"),
                digest: String::new(),
            },
            working_dir: PathBuf::from("/tmp/validator-0"),
            config_path: PathBuf::from("/tmp/validator-0/node.json"),
            command: LaunchCommand {
                executable: PathBuf::from("/bin/true"),
                args: Vec::new(),
                env: BTreeMap::new(),
            },
        }
    }

    fn monitor(probe: Arc<dyn Probe>, bus: EventBus) -> HealthMonitor {
        HealthMonitor::new(
            InstanceId::new("health").unwrap(),
            MonitorConfig::default()
                .with_interval(Duration::from_millis(20))
                .with_timeout(Duration::from_millis(100))
                .with_history(4),
            probe,
            bus,
        )
    }

    #[tokio::test]
    async fn test_three_failures_then_recovery() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let probe = ScriptedProbe(Mutex::new(Script::from([true, false, false, false, true])));
        let monitor = monitor(Arc::new(probe), bus.clone());
        let node = node(20002);

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(monitor.poll(&node).await.status);
        }

        assert_eq!(
            seen,
            vec![
                HealthStatus::Healthy,
                HealthStatus::Unhealthy,
                HealthStatus::Unhealthy,
                HealthStatus::Unreachable,
                HealthStatus::Healthy,
            ]
        );

        bus.close();
        let mut changes = Vec::new();
        while let Some(event) = events.recv().await {
            if let EventKind::HealthChanged { to, .. } = event.kind {
                changes.push(to);
            }
        }
        assert_eq!(
            changes,
            vec![
                HealthStatus::Healthy,
                HealthStatus::Unhealthy,
                HealthStatus::Unreachable,
                HealthStatus::Healthy,
            ]
        );
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let monitor = monitor(Arc::new(ScriptedProbe(Mutex::new(Script::new()))), EventBus::new());
        let node = node(20002);

        for _ in 0..10 {
            monitor.poll(&node).await;
        }

        let history = monitor.history(&node.id);
        assert_eq!(history.len(), 4);
        assert!(history.iter().all(|r| r.latency.is_some()));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let monitor = monitor(Arc::new(HangingProbe), EventBus::new());
        let record = monitor.poll(&node(20002)).await;

        assert_eq!(record.status, HealthStatus::Unhealthy);
        assert_eq!(record.latency, None);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = node(port);

        assert!(TcpProbe.probe(&node).await.is_ok());

        drop(listener);
        assert!(TcpProbe.probe(&node).await.is_err());
    }

    #[tokio::test]
    async fn test_watch_polls_until_cancelled() {
        let monitor = Arc::new(monitor(
            Arc::new(ScriptedProbe(Mutex::new(Script::new()))),
            EventBus::new(),
        ));
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let node = node(20002);

        monitor.watch(node.clone(), token.clone(), &tracker);
        tracker.close();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.status(&node.id), HealthStatus::Healthy);

        token.cancel();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_mark_unreachable() {
        let monitor = monitor(Arc::new(TcpProbe), EventBus::new());
        let id = NodeId::new("validator-0");

        assert_eq!(monitor.mark_unreachable(&id).status, HealthStatus::Unreachable);

        monitor.reset(&id);
        assert_eq!(monitor.status(&id), HealthStatus::Unknown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_publish_in_order() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let monitor = Arc::new(monitor(Arc::new(TcpProbe), bus.clone()));
        let id = NodeId::new("validator-0");

        let mut tasks = Vec::new();
        for worker in 0..4 {
            let monitor = Arc::clone(&monitor);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..200 {
                    if (worker + round) % 3 == 0 {
                        monitor.mark_unreachable(&id);
                    } else {
                        monitor.observe(&id, Some(Duration::from_millis(1)));
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        bus.close();
        let mut last = HealthStatus::Unknown;
        let mut changes = 0;
        while let Some(event) = events.recv().await {
            if let EventKind::HealthChanged { from, to } = event.kind {
                assert_eq!(from, last, "change {changes} does not follow the previous one");
                last = to;
                changes += 1;
            }
        }

        assert!(changes > 0);
        assert_eq!(last, monitor.status(&id));
    }
}
