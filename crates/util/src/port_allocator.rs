//! Contiguous port range allocation for local networks.

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, TcpListener};
use std::ops::Range;
use std::time::SystemTime;

use thiserror::Error;

/// Lowest port handed out by [`random_base_port`].
const RANDOM_BASE_MIN: u16 = 15000;

/// Width of the window [`random_base_port`] picks from.
const RANDOM_BASE_SPREAD: u64 = 10000;

/// Errors raised while allocating ports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Range width of zero was requested.
    #[error("port range width must be at least 1")]
    ZeroWidth,

    /// No free range left below 65535.
    #[error("no free port range of width {width} found at or above {start}")]
    Exhausted {
        /// First port the search started from.
        start: u16,
        /// Requested range width.
        width: u16,
    },
}

/// Pick a pseudo-random starting port in the 15000-25000 window.
///
/// Used when a template does not pin its base port, so that two networks
/// provisioned back to back do not start probing from the same place.
#[must_use]
pub fn random_base_port() -> u16 {
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    #[allow(clippy::cast_possible_truncation)]
    let offset = (hasher.finish() % RANDOM_BASE_SPREAD) as u16;
    RANDOM_BASE_MIN + offset
}

/// Check if a port is available by attempting to bind to it
#[must_use]
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).is_ok()
}

/// Hands out pairwise disjoint, contiguous port ranges.
///
/// Every range returned by one allocator is disjoint from every other range
/// it returned, regardless of what is bound on the host. When availability
/// checks are enabled, ranges containing a port that cannot be bound right
/// now are skipped.
#[derive(Debug, Clone)]
pub struct PortRangeAllocator {
    check_availability: bool,
    next: u16,
    reserved: HashSet<u16>,
    start: u16,
    width: u16,
}

impl PortRangeAllocator {
    /// Creates an allocator that hands out ranges of `width` ports starting
    /// at `start`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroWidth`] if `width` is zero.
    pub fn new(start: u16, width: u16) -> Result<Self, Error> {
        if width == 0 {
            return Err(Error::ZeroWidth);
        }

        Ok(Self {
            check_availability: true,
            next: start,
            reserved: HashSet::new(),
            start,
            width,
        })
    }

    /// Enables or disables the host bind check.
    #[must_use]
    pub const fn with_availability_check(mut self, check: bool) -> Self {
        self.check_availability = check;
        self
    }

    /// Marks ports as taken so no future range will contain them.
    pub fn reserve(&mut self, ports: impl IntoIterator<Item = u16>) {
        self.reserved.extend(ports);
    }

    /// Allocates the next free range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`] when no range fits below port 65535.
    pub fn allocate_range(&mut self) -> Result<Range<u16>, Error> {
        loop {
            let first = self.next;
            let Some(end) = first.checked_add(self.width) else {
                return Err(Error::Exhausted {
                    start: self.start,
                    width: self.width,
                });
            };

            let range = first..end;
            self.next = end;

            let usable = range.clone().all(|port| {
                !self.reserved.contains(&port)
                    && (!self.check_availability || is_port_available(port))
            });

            if usable {
                self.reserved.extend(range.clone());
                return Ok(range);
            }
        }
    }
}
