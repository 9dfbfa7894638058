//! Durable snapshots of network instances and their processes.
//!
//! A snapshot is a versioned JSON document stored next to the instance's
//! topology. It is rewritten atomically on every state transition so that a
//! later session can find processes left running by a crashed one.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::{Error, Result};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use localnet_process::ProcessHandle;
use localnet_topology::{InstanceId, NetworkInstance, NodeId};
use localnet_util::fs::write_atomic_async;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io;
use tokio::sync::Mutex;
use tracing::debug;

/// Snapshot format written by this version.
pub const SCHEMA_VERSION: u32 = 1;

/// Snapshot file name inside an instance's directory.
pub const SNAPSHOT_FILENAME: &str = "snapshot.json";

/// Persisted instance plus the processes serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version; see [`SCHEMA_VERSION`].
    pub schema_version: u32,

    /// Instance, including its node configurations and state.
    pub instance: NetworkInstance,

    /// Process metadata, one entry per running node.
    pub processes: Vec<ProcessHandle>,

    /// When the snapshot was written.
    pub saved_at: DateTime<Utc>,

    /// PID of the session supervising the instance, while active.
    #[serde(default)]
    pub supervisor_pid: Option<u32>,
}

impl Snapshot {
    /// Process recorded for `node`.
    #[must_use]
    pub fn process(&self, node: &NodeId) -> Option<&ProcessHandle> {
        self.processes.iter().find(|p| &p.node == node)
    }
}

/// File-backed snapshot store.
///
/// Saves for one instance are serialized; loads read whatever was last
/// renamed into place.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    locks: Arc<DashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl SnapshotStore {
    /// Creates a store writing under `dir/<instance-id>/`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Snapshot path of an instance.
    #[must_use]
    pub fn path(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(id.as_str()).join(SNAPSHOT_FILENAME)
    }

    fn lock(&self, id: &InstanceId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Saves a snapshot of `instance` and its processes.
    ///
    /// While the instance is active the current PID is recorded as its
    /// supervisor.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the snapshot cannot be written.
    pub async fn save(
        &self,
        instance: &NetworkInstance,
        processes: &[ProcessHandle],
    ) -> Result<Snapshot> {
        let supervisor_pid = instance.state().is_active().then(std::process::id);
        self.write(instance, processes, supervisor_pid).await
    }

    /// Saves a snapshot recording no supervisor, for processes left running
    /// on their own.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the snapshot cannot be written.
    pub async fn save_detached(
        &self,
        instance: &NetworkInstance,
        processes: &[ProcessHandle],
    ) -> Result<Snapshot> {
        self.write(instance, processes, None).await
    }

    async fn write(
        &self,
        instance: &NetworkInstance,
        processes: &[ProcessHandle],
        supervisor_pid: Option<u32>,
    ) -> Result<Snapshot> {
        let snapshot = Snapshot {
            schema_version: SCHEMA_VERSION,
            instance: instance.clone(),
            processes: processes.to_vec(),
            saved_at: Utc::now(),
            supervisor_pid,
        };

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let path = self.path(instance.id());

        let lock = self.lock(instance.id());
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io("error creating snapshot directory", e))?;
        }
        write_atomic_async(&path, &bytes)
            .await
            .map_err(|e| Error::Io("error writing snapshot", e))?;

        debug!(
            instance = %instance.id(),
            state = %instance.state(),
            processes = processes.len(),
            "Saved snapshot"
        );

        Ok(snapshot)
    }

    /// Loads the snapshot of an instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if there is none, or [`Error::Corrupt`] if
    /// it cannot be parsed or has an unknown schema version.
    pub async fn load(&self, id: &InstanceId) -> Result<Snapshot> {
        let path = self.path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(id.clone()));
            }
            Err(e) => return Err(Error::Io("error reading snapshot", e)),
        };

        parse(&path, &bytes)
    }

    /// Removes the snapshot of an instance, if any.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file exists but cannot be removed.
    pub async fn delete(&self, id: &InstanceId) -> Result<()> {
        let lock = self.lock(id);
        let _guard = lock.lock().await;

        match fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io("error deleting snapshot", e)),
        }
    }
}

fn parse(path: &Path, bytes: &[u8]) -> Result<Snapshot> {
    let corrupt = |reason: String| Error::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;

    match value.get("schema_version").and_then(serde_json::Value::as_u64) {
        Some(v) if v == u64::from(SCHEMA_VERSION) => {}
        Some(v) => return Err(corrupt(format!("unsupported schema version {v}"))),
        None => return Err(corrupt("missing schema_version".to_string())),
    }

    serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))
}
