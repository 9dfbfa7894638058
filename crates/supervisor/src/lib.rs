//! Process supervision and lifecycle orchestration for local networks.
//!
//! A [`Supervisor`] owns the node processes of one instance. The
//! [`NetworkManager`] drives whole instances through their lifecycle:
//! provisioning, startup with readiness gating, health evaluation, shutdown
//! and recovery of processes left behind by an earlier session.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod config;
mod error;
mod lock;
mod network;
mod reconcile;
mod supervisor;

pub use config::{SpawnRetry, SupervisorConfig};
pub use error::{Error, ErrorKind, Result};
pub use lock::holder as lock_holder;
pub use network::{NetworkManager, NetworkStatus, NodeStatus, Recovery};
pub use reconcile::{Reconciliation, StaleNode, reconcile};
pub use supervisor::Supervisor;
