//! Candidate worker-manager records.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Transport used to reach a worker manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectType {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for ConnectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Stable index of a [`Server`] inside the selector arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ServerId(pub(crate) usize);

/// One candidate worker-manager endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// Address of the worker-manager instance.
    pub address: SocketAddr,
    /// Worker this server most recently routed us to (for failure attribution).
    pub worker_address: Option<SocketAddr>,
    /// Fixed for the lifetime of the record.
    pub connect_type: ConnectType,
    /// Whether a session through this server has ever succeeded.
    pub once_work: bool,
    /// Current backoff interval in milliseconds (0 = no penalty).
    pub interval: u64,
    /// While available: earliest selection time (0 = eligible now).
    /// While in use: time of the last touch, used for timeout detection.
    pub ts: u64,
}

impl Server {
    pub(crate) fn new(connect_type: ConnectType, address: SocketAddr) -> Self {
        Self {
            address,
            worker_address: None,
            connect_type,
            once_work: false,
            interval: 0,
            ts: 0,
        }
    }

    pub(crate) fn matches(&self, address: SocketAddr, connect_type: ConnectType) -> bool {
        self.address == address && self.connect_type == connect_type
    }

    /// Clears any backoff so the server is immediately eligible.
    pub(crate) fn reset_backoff(&mut self) {
        self.interval = 0;
        self.ts = 0;
    }
}
