//! CLI binary to run local blockchain test networks.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use localnet_events::{Event, EventKind, Subscription};
use localnet_process::OutputMode;
use localnet_supervisor::{ErrorKind, NetworkManager, NetworkStatus, SupervisorConfig};
use localnet_topology::{InstanceId, InstanceState, NodeId, Template};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

const LOG_FOLLOW_INTERVAL: Duration = Duration::from_millis(250);

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Supervisor or network manager error
    #[error(transparent)]
    Supervisor(#[from] localnet_supervisor::Error),

    /// Template or topology error
    #[error(transparent)]
    Topology(#[from] localnet_topology::Error),

    /// The instance failed while supervised
    #[error("instance {0} failed")]
    InstanceFailed(InstanceId),

    /// Status rendering error
    #[error("failed to render status: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// Logging setup error
    #[error("failed to install log subscriber: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl Error {
    /// Process exit code: 1 for configuration errors, 2 for spawn and
    /// runtime errors, 3 for unknown instances or nodes.
    fn exit_code(&self) -> u8 {
        let kind = match self {
            Self::Supervisor(e) => e.kind(),
            Self::Topology(e) if e.is_not_found() => ErrorKind::NotFound,
            Self::Topology(e) if e.is_config() => ErrorKind::Config,
            Self::Topology(_) => ErrorKind::Io,
            Self::InstanceFailed(_) | Self::Json(_) | Self::Io(..) | Self::Tracing(_) => {
                ErrorKind::Spawn
            }
        };

        match kind {
            ErrorKind::Config => 1,
            ErrorKind::Spawn | ErrorKind::Io | ErrorKind::Corrupt => 2,
            ErrorKind::NotFound => 3,
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding every instance
    #[arg(long, global = true, default_value = ".localnet", env = "LOCALNET_DATA_DIR")]
    data_dir: PathBuf,

    /// Maximum log level
    #[arg(long, global = true, default_value = "info", env = "LOCALNET_LOG_LEVEL")]
    log_level: Level,

    /// Seconds between SIGTERM and SIGKILL when stopping a node
    #[arg(long, global = true, default_value_t = 10, env = "LOCALNET_STOP_TIMEOUT")]
    stop_timeout: u64,

    /// Seconds to wait for an instance to become ready
    #[arg(long, global = true, default_value_t = 30, env = "LOCALNET_READINESS_TIMEOUT")]
    readiness_timeout: u64,

    /// Milliseconds between health polls of a node
    #[arg(long, global = true, default_value_t = 2000, env = "LOCALNET_POLL_INTERVAL_MS")]
    poll_interval_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Provision and start an instance from a template file, or start an
    /// existing instance by id
    Start {
        /// Template file or instance id
        target: String,

        /// Leave the nodes running in the background once ready
        #[arg(long)]
        detach: bool,
    },

    /// Stop an instance, whichever process supervises it
    Stop {
        /// Instance id
        id: String,
    },

    /// Show an instance and its nodes
    Status {
        /// Instance id
        id: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print a node's captured output
    Logs {
        /// Instance id
        id: String,

        /// Node id, e.g. validator-0
        node: String,

        /// Number of trailing lines to print
        #[arg(long, short = 'n', default_value_t = 100)]
        lines: usize,

        /// Keep printing new output until interrupted
        #[arg(long, short = 'f')]
        follow: bool,
    },

    /// List provisioned instances
    List,

    /// Wipe chain data and logs of a stopped instance
    Reset {
        /// Instance id
        id: String,
    },

    /// Remove a stopped instance entirely
    Delete {
        /// Instance id
        id: String,
    },

    /// Take over an instance left running by an earlier session
    Recover {
        /// Instance id
        id: String,

        /// Leave the nodes running in the background once recovered
        #[arg(long)]
        detach: bool,
    },
}

impl Args {
    fn supervisor_config(&self) -> SupervisorConfig {
        let defaults = SupervisorConfig::default();
        let detach = matches!(
            self.command,
            Command::Start { detach: true, .. } | Command::Recover { detach: true, .. }
        );

        defaults
            .with_stop_timeout(Duration::from_secs(self.stop_timeout))
            .with_readiness_timeout(Duration::from_secs(self.readiness_timeout))
            .with_monitor(
                defaults
                    .monitor
                    .with_interval(Duration::from_millis(self.poll_interval_ms)),
            )
            // Detached nodes outlive this process, so their output cannot be
            // piped through it.
            .with_output(if detach {
                OutputMode::File
            } else {
                OutputMode::Forward
            })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors are configuration errors, not clap's default of 2.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let manager = NetworkManager::new(&args.data_dir, args.supervisor_config());

    // Create shared shutdown token
    let shutdown_token = CancellationToken::new();
    spawn_signal_handler(shutdown_token.clone());

    match args.command {
        Command::Start { target, detach } => {
            start(&manager, &target, detach, &shutdown_token).await
        }
        Command::Stop { id } => {
            let id = instance_id(&id)?;
            let outcome = manager.stop(&id).await?;
            println!("{id} stopped ({outcome:?})");
            Ok(())
        }
        Command::Status { id, json } => {
            let id = instance_id(&id)?;
            let status = manager.status(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", render_status(&status));
            }
            Ok(())
        }
        Command::Logs {
            id,
            node,
            lines,
            follow,
        } => {
            let id = instance_id(&id)?;
            logs(&manager, &id, &NodeId::new(node), lines, follow, &shutdown_token).await
        }
        Command::List => {
            for instance in manager.list()? {
                println!(
                    "{:<24} {:<12} {} node(s)  {}",
                    instance.id().to_string(),
                    instance.state().to_string(),
                    instance.nodes().len(),
                    instance.data_dir().display()
                );
            }
            Ok(())
        }
        Command::Reset { id } => {
            let id = instance_id(&id)?;
            manager.reset(&id).await?;
            println!("{id} reset");
            Ok(())
        }
        Command::Delete { id } => {
            let id = instance_id(&id)?;
            manager.delete(&id).await?;
            println!("{id} deleted");
            Ok(())
        }
        Command::Recover { id, detach } => {
            let id = instance_id(&id)?;
            recover(&manager, &id, detach, &shutdown_token).await
        }
    }
}

/// Parses an instance id argument; a malformed id is a configuration error.
fn instance_id(raw: &str) -> Result<InstanceId, Error> {
    Ok(InstanceId::new(raw)?)
}

fn spawn_signal_handler(shutdown_token: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            _ => {
                warn!("Failed to install signal handlers, falling back to ctrl-c");
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                info!("Received interrupt signal");
            }
        }

        info!("Shutting down");
        shutdown_token.cancel();
    });
}

async fn start(
    manager: &NetworkManager,
    target: &str,
    detach: bool,
    shutdown_token: &CancellationToken,
) -> Result<(), Error> {
    let events = manager.subscribe();

    let starting = async {
        if Path::new(target).is_file() {
            let template = Template::from_path(Path::new(target))?;
            Ok::<_, Error>(manager.start(&template).await?)
        } else {
            let id = InstanceId::new(target)?;
            Ok(manager.start_instance(&id).await?)
        }
    };

    // The start future is dropped before shutting down so it releases the
    // instance.
    let started = tokio::select! {
        result = starting => Some(result),
        () = shutdown_token.cancelled() => None,
    };
    let Some(started) = started else {
        manager.shutdown().await?;
        return Ok(());
    };

    let instance = started?;
    println!("{} is {}", instance.id(), instance.state());

    finish(manager, instance.id(), detach, events, shutdown_token).await
}

async fn recover(
    manager: &NetworkManager,
    id: &InstanceId,
    detach: bool,
    shutdown_token: &CancellationToken,
) -> Result<(), Error> {
    let events = manager.subscribe();

    let recovered = tokio::select! {
        result = manager.recover(id) => Some(result),
        () = shutdown_token.cancelled() => None,
    };
    let Some(recovered) = recovered else {
        manager.shutdown().await?;
        return Ok(());
    };

    let recovery = recovered?;
    println!(
        "{} is {}: adopted {} node(s), re-spawned {}",
        id,
        recovery.instance.state(),
        recovery.adopted.len(),
        recovery.respawned.len()
    );

    finish(manager, id, detach, events, shutdown_token).await
}

/// Detaches from a started instance, or supervises it until interrupted.
async fn finish(
    manager: &NetworkManager,
    id: &InstanceId,
    detach: bool,
    events: Subscription,
    shutdown_token: &CancellationToken,
) -> Result<(), Error> {
    if detach {
        manager.detach(id).await?;
        println!("Detached; stop it with `localnet stop {id}`");
        return Ok(());
    }

    let result = supervise(id, events, shutdown_token).await;

    let outcome = manager.shutdown().await?;
    info!(?outcome, "Stopped");
    result
}

async fn supervise(
    id: &InstanceId,
    mut events: Subscription,
    shutdown_token: &CancellationToken,
) -> Result<(), Error> {
    info!(instance = %id, "Supervising; press ctrl-c to stop");

    loop {
        let event = tokio::select! {
            () = shutdown_token.cancelled() => return Ok(()),
            event = events.recv() => event,
        };
        let Some(event) = event else {
            return Ok(());
        };

        log_event(&event);
        if event.instance == *id
            && matches!(
                event.kind,
                EventKind::InstanceStateChanged {
                    to: InstanceState::Failed,
                    ..
                }
            )
        {
            return Err(Error::InstanceFailed(id.clone()));
        }
    }
}

fn log_event(event: &Event) {
    let node = event.node.as_ref().map_or("-", NodeId::as_str);
    match &event.kind {
        EventKind::SpawnFailed { error } => {
            error!(instance = %event.instance, node, "Spawn failed: {}", error);
        }
        EventKind::Exited { code } => {
            warn!(instance = %event.instance, node, "Exited with {:?}", code);
        }
        EventKind::Stale { pid } => {
            warn!(instance = %event.instance, node, "Stale process {}", pid);
        }
        kind => info!(instance = %event.instance, node, "{:?}", kind),
    }
}

fn render_status(status: &NetworkStatus) -> String {
    use std::fmt::Write;

    let instance = &status.instance;
    let mut out = format!("{} ({}) is {}", instance.id(), instance.name(), instance.state());
    match status.supervisor {
        Some(pid) => {
            let _ = writeln!(out, ", supervised by pid {pid}");
        }
        None => out.push('\n'),
    }

    let _ = writeln!(
        out,
        "{:<16} {:<12} {:>8} {:<8} {:<12} {:>8} {:>6} {:>6} {:>6}",
        "NODE", "ROLE", "PID", "RUNNING", "HEALTH", "RESTARTS", "P2P", "RPC", "HPORT"
    );
    for node in &status.nodes {
        let _ = writeln!(
            out,
            "{:<16} {:<12} {:>8} {:<8} {:<12} {:>8} {:>6} {:>6} {:>6}",
            node.id.to_string(),
            node.role.to_string(),
            node.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string()),
            if node.running { "yes" } else { "no" },
            node.health.to_string(),
            node.restarts,
            node.ports.p2p,
            node.ports.rpc,
            node.ports.health,
        );
    }

    out
}

async fn logs(
    manager: &NetworkManager,
    id: &InstanceId,
    node: &NodeId,
    lines: usize,
    follow: bool,
    shutdown_token: &CancellationToken,
) -> Result<(), Error> {
    let instance = manager.topology().refresh(id)?;
    let config = instance
        .node(node)
        .ok_or_else(|| localnet_supervisor::Error::UnknownNode {
            instance: id.clone(),
            node: node.clone(),
        })?;
    let path = config.log_path();

    let contents = read_log(&path).await?;
    print!("{}", tail(&contents, lines));

    if !follow {
        return Ok(());
    }

    let mut printed = contents.len();
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => return Ok(()),
            () = tokio::time::sleep(LOG_FOLLOW_INTERVAL) => {}
        }

        let contents = read_log(&path).await?;
        if contents.len() < printed {
            // Truncated by a reset.
            printed = 0;
        }
        if let Some(new) = contents.get(printed..) {
            print!("{new}");
        }
        printed = contents.len();
    }
}

async fn read_log(path: &Path) -> Result<String, Error> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(Error::Io("failed to read node log", e)),
    }
}

/// Last `lines` lines of `contents`, keeping the trailing newline.
fn tail(contents: &str, lines: usize) -> &str {
    if lines == 0 {
        return "";
    }

    let trimmed = contents.strip_suffix('\n').unwrap_or(contents);
    trimmed
        .match_indices('\n')
        .rev()
        .nth(lines - 1)
        .map_or(contents, |(idx, _)| &contents[idx + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_start() {
        let args = Args::try_parse_from([
            "localnet",
            "--data-dir",
            "/tmp/nets",
            "start",
            "dev.toml",
            "--detach",
        ])
        .unwrap();

        assert_eq!(args.data_dir, PathBuf::from("/tmp/nets"));
        assert!(matches!(
            &args.command,
            Command::Start { target, detach: true } if target == "dev.toml"
        ));
        assert_eq!(args.supervisor_config().output, OutputMode::File);
    }

    #[test]
    fn test_invalid_instance_id_is_a_config_error() {
        let args = Args::try_parse_from(["localnet", "stop", "Not/An/Id"]).unwrap();
        let Command::Stop { id } = args.command else {
            panic!("expected stop");
        };

        let err = instance_id(&id).unwrap_err();
        assert!(matches!(
            err,
            Error::Topology(localnet_topology::Error::InvalidInstanceId(_))
        ));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(instance_id("dev-1").unwrap().as_str(), "dev-1");
    }

    #[test]
    fn test_tail() {
        let log = "a\nb\nc\n";
        assert_eq!(tail(log, 2), "b\nc\n");
        assert_eq!(tail(log, 3), log);
        assert_eq!(tail(log, 10), log);
        assert_eq!(tail(log, 0), "");
        assert_eq!(tail("a\nb", 1), "b");
        assert_eq!(tail("", 5), "");
    }

    #[test]
    fn test_exit_codes() {
        let id = InstanceId::new("dev").unwrap();

        assert_eq!(
            Error::from(localnet_topology::Error::ZeroValidators(id.clone())).exit_code(),
            1
        );
        assert_eq!(
            Error::from(localnet_topology::Error::NotFound(id.clone())).exit_code(),
            3
        );
        assert_eq!(Error::InstanceFailed(id.clone()).exit_code(), 2);
        assert_eq!(
            Error::from(localnet_supervisor::Error::UnknownNode {
                instance: id,
                node: NodeId::new("validator-7"),
            })
            .exit_code(),
            3
        );
    }

    #[test]
    fn test_demo_template_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/devnet.toml");
        let template = Template::from_path(&path).unwrap();

        assert_eq!(template.check().unwrap().as_str(), "devnet");
        assert_eq!(template.validators, 4);
        assert!(template.api_gateway);
    }

    #[tokio::test]
    async fn test_status_of_provisioned_instance() {
        let dir = tempfile::tempdir().unwrap();
        let manager = NetworkManager::new(dir.path(), SupervisorConfig::default());
        let template = Template::new("table").with_validators(2).with_binary(
            localnet_topology::NodeRole::Validator,
            localnet_topology::BinarySpec::new("/bin/sh"),
        );
        let instance = manager.provision(&template).await.unwrap();

        let rendered = render_status(&manager.status(instance.id()).await.unwrap());

        assert!(rendered.starts_with("table (table) is unprovisioned\n"));
        assert!(rendered.contains("validator-1"));
        assert_eq!(rendered.lines().count(), 4);
    }
}
