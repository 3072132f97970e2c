//! Channel running state.

use std::fmt;
use std::net::SocketAddr;

/// Phase of a `WorkerManagerChannel`.
///
/// `ConnectingAp` carries the id of the outstanding AP request so a late
/// answer to an older request can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Configured; `establish_connection` may be called.
    Initialized,
    /// Waiting for the AP answer to `request_id`.
    ConnectingAp { request_id: u64 },
    /// AP answered; the pool holds its servers.
    ConnectedAp,
    /// Connected to a worker manager.
    ConnectedWorkerManager { remote: SocketAddr },
}

impl ChannelState {
    /// Short name for logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::ConnectingAp { .. } => "connecting_ap",
            Self::ConnectedAp => "connected_ap",
            Self::ConnectedWorkerManager { .. } => "connected_worker_manager",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
