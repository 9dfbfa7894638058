//! Health probes.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use localnet_topology::NodeConfig;
use tokio::net::TcpStream;

/// Checks whether a node answers on its health endpoint.
///
/// A probe makes exactly one attempt; the monitor bounds it with the poll
/// timeout and never retries within an interval.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    /// Probes `node` once.
    async fn probe(&self, node: &NodeConfig) -> io::Result<()>;
}

/// Probe that succeeds when a TCP connection to the health port is accepted.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpProbe;

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, node: &NodeConfig) -> io::Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, node.ports.health));
        TcpStream::connect(addr).await.map(drop)
    }
}
