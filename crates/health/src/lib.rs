//! Health and readiness monitoring for local network nodes.
//!
//! Every node gets its own polling task. Polls go through a [`Probe`] (TCP
//! connect to the node's health port by default), are bounded by a timeout
//! and feed a per-node [`HealthTracker`]. [`assess`] folds node statuses into
//! an instance-level [`Assessment`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod monitor;
mod probe;
mod readiness;
mod tracker;

pub use config::MonitorConfig;
pub use monitor::{HealthMonitor, HealthRecord};
pub use probe::{Probe, TcpProbe};
pub use readiness::{Assessment, assess};
pub use tracker::HealthTracker;
