//! Spawning and stopping node processes.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use localnet_topology::{NodeConfig, NodeId};
use localnet_util::is_port_available;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::handle::StopOutcome;
use crate::proc_table::{is_alive, to_pid};

/// Startup grace window applied by [`NodeSpawner::default`].
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(250);

/// How long to wait for a process to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Poll interval when waiting on a process that is not our child.
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when killed by a signal or not observable.
    pub code: Option<i32>,

    /// Terminating signal, if any.
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl ExitInfo {
    const UNKNOWN: Self = Self {
        code: None,
        signal: None,
    };
}

#[derive(Debug)]
enum Tracking {
    /// Spawned by us; exit is observed by reaping.
    Child {
        exit: watch::Receiver<Option<ExitInfo>>,
        task_tracker: TaskTracker,
    },

    /// Found alive from an earlier session; exit is observed by polling.
    Adopted,
}

/// A running (or exited) node process.
#[derive(Debug)]
pub struct NodeProcess {
    node: NodeId,
    pid: u32,
    tracking: Tracking,
}

impl NodeProcess {
    /// Tracks a process this session did not spawn.
    ///
    /// The caller is responsible for checking that `pid` runs the node's
    /// command line, see [`crate::proc_table::check`].
    #[must_use]
    pub const fn adopt(node: NodeId, pid: u32) -> Self {
        Self {
            node,
            pid,
            tracking: Tracking::Adopted,
        }
    }

    /// Returns the process ID.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Node the process serves.
    #[must_use]
    pub const fn node(&self) -> &NodeId {
        &self.node
    }

    /// Whether the process was adopted rather than spawned.
    #[must_use]
    pub const fn is_adopted(&self) -> bool {
        matches!(self.tracking, Tracking::Adopted)
    }

    /// How the process ended, or `None` while it runs.
    #[must_use]
    pub fn exit(&self) -> Option<ExitInfo> {
        match &self.tracking {
            Tracking::Child { exit, .. } => *exit.borrow(),
            Tracking::Adopted => (!is_alive(self.pid)).then_some(ExitInfo::UNKNOWN),
        }
    }

    /// Whether the process is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.exit().is_none()
    }

    /// Waits for the process to exit.
    ///
    /// Dropping the future stops waiting; it never affects the process.
    pub async fn wait(&self) -> ExitInfo {
        match &self.tracking {
            Tracking::Child { exit, .. } => {
                let mut exit = exit.clone();
                match exit.wait_for(Option::is_some).await {
                    Ok(info) => (*info).unwrap_or(ExitInfo::UNKNOWN),
                    // Monitor task gone without reporting.
                    Err(_) => ExitInfo::UNKNOWN,
                }
            }
            Tracking::Adopted => {
                while is_alive(self.pid) {
                    tokio::time::sleep(ADOPTED_POLL_INTERVAL).await;
                }
                debug!("Process {} no longer exists", self.pid);
                ExitInfo::UNKNOWN
            }
        }
    }

    /// Sends a signal to the process group led by the process, falling back
    /// to the process alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal could not be sent.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        send_signal(self.pid, sig)
    }

    /// Stops the process: SIGTERM, wait up to `timeout`, then SIGKILL.
    ///
    /// Stopping a process that is not running returns [`StopOutcome::Ack`].
    ///
    /// # Errors
    ///
    /// Returns an error if a signal could not be delivered, or if the
    /// process survived SIGKILL.
    pub async fn stop(&self, timeout: Duration) -> Result<StopOutcome> {
        if !self.is_running() {
            return Ok(StopOutcome::Ack);
        }

        info!(node = %self.node, pid = self.pid, "Stopping process");

        match self.signal(Signal::SIGTERM) {
            Ok(()) => {}
            Err(Error::Signal {
                source: Errno::ESRCH,
                ..
            }) => return Ok(StopOutcome::Ack),
            Err(e) => return Err(e),
        }

        if let Ok(exit) = tokio::time::timeout(timeout, self.wait()).await {
            info!(node = %self.node, "Process exited with {:?}", exit);
            return Ok(StopOutcome::Ack);
        }

        error!(
            node = %self.node,
            "Timeout waiting for process to exit, killing..."
        );
        match self.signal(Signal::SIGKILL) {
            Ok(())
            | Err(Error::Signal {
                source: Errno::ESRCH,
                ..
            }) => {}
            Err(e) => return Err(e),
        }

        if tokio::time::timeout(KILL_WAIT, self.wait()).await.is_err() {
            return Err(Error::Io(
                "process survived SIGKILL",
                std::io::Error::new(std::io::ErrorKind::TimedOut, self.pid.to_string()),
            ));
        }

        Ok(StopOutcome::ForceKillApplied)
    }

    /// Waits for output forwarding of a spawned process to finish.
    pub async fn flush_output(&self, timeout: Duration) {
        if let Tracking::Child { task_tracker, .. } = &self.tracking {
            if tokio::time::timeout(timeout, task_tracker.wait())
                .await
                .is_err()
            {
                debug!(node = %self.node, "Output still open after {:?}", timeout);
            }
        }
    }
}

/// Sends `sig` to the group led by `pid`, or to `pid` alone if it leads no
/// group.
///
/// # Errors
///
/// Returns [`Error::Signal`] if neither could be signalled.
pub fn send_signal(pid: u32, sig: Signal) -> Result<()> {
    let target = to_pid(pid).ok_or(Error::Signal {
        pid,
        source: Errno::EINVAL,
    })?;

    signal::killpg(target, sig)
        .or_else(|_| signal::kill(target, sig))
        .map_err(|source| Error::Signal { pid, source })
}

/// How node output is captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Piped through this process into `node.log` and `tracing`.
    #[default]
    Forward,

    /// Written straight to `node.log`, so nodes outlive this process.
    File,
}

/// Spawns node processes.
#[derive(Debug, Clone)]
pub struct NodeSpawner {
    output: OutputMode,
    startup_grace: Duration,
}

impl Default for NodeSpawner {
    fn default() -> Self {
        Self {
            output: OutputMode::default(),
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}

impl NodeSpawner {
    /// Creates a spawner with the default startup grace window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the window during which an exit counts as a startup failure.
    #[must_use]
    pub const fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Sets how node output is captured.
    #[must_use]
    pub const fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Spawns the process for `node`.
    ///
    /// The working directory is created when missing; output goes to
    /// `node.log` inside it, and in [`OutputMode::Forward`] also to `tracing`
    /// at debug level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingBinary`], [`Error::InvalidConfig`] or
    /// [`Error::ExitedDuringStartup`] for permanent failures, and
    /// [`Error::PortConflict`] or [`Error::Spawn`] for transient ones.
    pub async fn spawn(&self, node: &NodeConfig) -> Result<NodeProcess> {
        let id = node.id.clone();

        if which::which(&node.command.executable).is_err() {
            return Err(Error::MissingBinary {
                node: id,
                path: node.command.executable.clone(),
            });
        }

        let log = prepare_working_dir(node).await?;

        for port in node.ports.ports() {
            if !is_port_available(port) {
                return Err(Error::PortConflict { node: id, port });
            }
        }

        let mut cmd = Command::new(&node.command.executable);
        cmd.args(node.resolved_args())
            .current_dir(&node.working_dir)
            .envs(node.env())
            .stdin(Stdio::null())
            // Own group, so terminal signals reach the supervisor only and
            // stop reaches the node's own children.
            .process_group(0);

        let log = match self.output {
            OutputMode::Forward => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
                Some(log)
            }
            OutputMode::File => {
                let stdout = log.into_std().await;
                let stderr = stdout
                    .try_clone()
                    .map_err(|e| Error::Io("failed to duplicate node log handle", e))?;
                cmd.stdout(stdout).stderr(stderr);
                None
            }
        };

        debug!(node = %id, "Spawning process: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Error::MissingBinary {
                    node: id.clone(),
                    path: node.command.executable.clone(),
                }
            }
            _ => Error::Spawn {
                node: id.clone(),
                source: e,
            },
        })?;

        let pid = child.id().ok_or_else(|| Error::Spawn {
            node: id.clone(),
            source: std::io::Error::other("no PID available for spawned process"),
        })?;

        debug!(node = %id, "Process spawned with PID: {}", pid);

        let task_tracker = TaskTracker::new();

        if let Some(log) = log {
            let log = Arc::new(Mutex::new(log));
            if let Some(stdout) = child.stdout.take() {
                task_tracker.spawn(forward_output(id.clone(), "stdout", stdout, Arc::clone(&log)));
            }
            if let Some(stderr) = child.stderr.take() {
                task_tracker.spawn(forward_output(id.clone(), "stderr", stderr, log));
            }
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor_node = id.clone();
        task_tracker.spawn(async move {
            let info = match child.wait().await {
                Ok(status) => {
                    if status.success() {
                        info!(node = %monitor_node, "Process exited with status: {}", status);
                    } else {
                        warn!(node = %monitor_node, "Process exited with non-zero status: {}", status);
                    }
                    ExitInfo::from(status)
                }
                Err(err) => {
                    error!(node = %monitor_node, "Failed to wait for process: {}", err);
                    ExitInfo::UNKNOWN
                }
            };
            let _ = exit_tx.send(Some(info));
        });

        task_tracker.close();

        let process = NodeProcess {
            node: id.clone(),
            pid,
            tracking: Tracking::Child {
                exit: exit_rx,
                task_tracker,
            },
        };

        if self.startup_grace.is_zero() {
            return Ok(process);
        }

        match tokio::time::timeout(self.startup_grace, process.wait()).await {
            Err(_) => Ok(process),
            Ok(exit) => {
                process.flush_output(self.startup_grace).await;

                // A port taken while we were starting explains the exit.
                if let Some(port) = node.ports.ports().into_iter().find(|p| !is_port_available(*p)) {
                    return Err(Error::PortConflict { node: id, port });
                }

                Err(Error::ExitedDuringStartup {
                    node: id,
                    code: exit.code,
                })
            }
        }
    }
}

async fn prepare_working_dir(node: &NodeConfig) -> Result<File> {
    let invalid = |reason: String| Error::InvalidConfig {
        node: node.id.clone(),
        reason,
    };

    tokio::fs::create_dir_all(&node.working_dir)
        .await
        .map_err(|e| {
            invalid(format!(
                "cannot create working directory {}: {e}",
                node.working_dir.display()
            ))
        })?;

    if !tokio::fs::try_exists(&node.config_path)
        .await
        .unwrap_or(false)
    {
        return Err(invalid(format!(
            "config file {} does not exist",
            node.config_path.display()
        )));
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(node.log_path())
        .await
        .map_err(|e| {
            invalid(format!(
                "working directory {} is not writable: {e}",
                node.working_dir.display()
            ))
        })
}

async fn forward_output<R>(node: NodeId, stream: &'static str, reader: R, log: Arc<Mutex<File>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(node = %node, stream, "{}", line);

        let mut file = log.lock().await;
        if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
            warn!(node = %node, "Failed to write node log: {}", e);
        }
    }

    if let Err(e) = log.lock().await.flush().await {
        warn!(node = %node, "Failed to flush node log: {}", e);
    }
}
