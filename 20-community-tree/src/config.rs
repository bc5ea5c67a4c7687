//! Node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::transport::Timeouts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    /// Address the listener binds. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// How long one `accept` waits before the loop re-checks for shutdown.
    pub accept_timeout: Duration,
    pub timeouts: Timeouts,
}

impl NodeConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Self::default()
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 1664)),
            accept_timeout: Duration::from_secs(1),
            timeouts: Timeouts::default(),
        }
    }
}
