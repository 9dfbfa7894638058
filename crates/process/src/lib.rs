//! Node process supervision primitives.
//!
//! [`NodeSpawner`] launches the binary described by a
//! [`NodeConfig`](localnet_topology::NodeConfig), captures its output and
//! reports startup failures as typed errors. [`NodeProcess`] stops a process
//! with the SIGTERM-then-SIGKILL protocol, whether it was spawned by this
//! session or adopted from an earlier one.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod error;
mod handle;
pub mod proc_table;
mod spawn;

pub use error::{Error, Result};
pub use handle::{ProcessHandle, StopOutcome};
pub use proc_table::PidState;
pub use spawn::{
    DEFAULT_STARTUP_GRACE, ExitInfo, NodeProcess, NodeSpawner, OutputMode, send_signal,
};
