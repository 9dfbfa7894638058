//! Shared helpers for the network manager tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use localnet_health::{MonitorConfig, Probe};
use localnet_supervisor::{NetworkManager, SpawnRetry, SupervisorConfig};
use localnet_topology::{BinarySpec, InstanceId, InstanceState, NodeConfig, NodeRole, Template};
use parking_lot::Mutex;

/// Shell loop that exits cleanly on SIGTERM.
pub const LOOP: &str = "trap 'exit 0' TERM; while true; do sleep 0.05; done";

/// Shell loop that ignores SIGTERM.
pub const STUBBORN: &str = "trap '' TERM; while true; do sleep 0.05; done";

/// Probe reporting every node healthy unless switched off.
#[derive(Default)]
pub struct SwitchProbe {
    down: Mutex<HashSet<String>>,
}

impl SwitchProbe {
    pub fn set_down(&self, node: &str, down: bool) {
        let mut nodes = self.down.lock();
        if down {
            nodes.insert(node.to_string());
        } else {
            nodes.remove(node);
        }
    }
}

#[async_trait]
impl Probe for SwitchProbe {
    async fn probe(&self, node: &NodeConfig) -> io::Result<()> {
        if self.down.lock().contains(node.id.as_str()) {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "switched off"))
        } else {
            Ok(())
        }
    }
}

pub fn config() -> SupervisorConfig {
    SupervisorConfig::default()
        .with_stop_timeout(Duration::from_secs(2))
        .with_readiness_timeout(Duration::from_secs(5))
        .with_startup_grace(Duration::from_millis(100))
        .with_retry(SpawnRetry::default().with_initial_backoff(Duration::from_millis(10)))
        .with_monitor(
            MonitorConfig::default()
                .with_interval(Duration::from_millis(20))
                .with_timeout(Duration::from_millis(200)),
        )
}

pub fn manager(root: &Path, probe: &Arc<SwitchProbe>) -> NetworkManager {
    NetworkManager::with_probe(root, config(), Arc::clone(probe) as Arc<dyn Probe>)
}

pub fn template(name: &str, validators: u16) -> Template {
    Template::new(name)
        .with_validators(validators)
        .with_binary(NodeRole::Validator, BinarySpec::new("/bin/sh").with_args(["-c", LOOP]))
}

/// Writes an executable `#!/bin/sh` node script, so the process runs under
/// the interpreter's command line rather than the configured one.
pub fn wrapper_script(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("node.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{LOOP}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn id(name: &str) -> InstanceId {
    InstanceId::new(name).unwrap()
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_for(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for_state(manager: &NetworkManager, id: &InstanceId, state: InstanceState) {
    wait_for(&format!("{id} to be {state}"), Duration::from_secs(10), || {
        manager.topology().load(id).unwrap().state() == state
    })
    .await;
}
