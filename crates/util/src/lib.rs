//! Small shared helpers: port allocation and atomic file writes.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod fs;
pub mod port_allocator;

pub use port_allocator::{PortRangeAllocator, is_port_available, random_base_port};
