//! Observer abstraction for decoupling the channel from its owner.
//!
//! The channel depends on the [`ChannelObserver`] trait rather than concrete
//! callbacks, enabling testing and alternative delivery (direct calls, mpsc
//! forwarding in the runtime).

use std::net::SocketAddr;

use crate::error::WorkerManagerErrorCode;

/// Owner callbacks of a `WorkerManagerChannel`.
///
/// Error callbacks are always deferred to a later loop iteration, so an
/// observer may call back into the channel's owner without re-entrancy.
pub trait ChannelObserver: Send {
    /// The channel connected to a worker manager.
    fn on_ready(&mut self, remote: SocketAddr);

    /// The channel hit a failure the owner must act on.
    fn on_error(&mut self, code: WorkerManagerErrorCode);

    /// A worker-manager message arrived.
    fn on_message(&mut self, command: &str, raw: &str);
}

/// Logging observer for debugging and development.
///
/// Logs every notification at debug level. The runtime runs it ahead of
/// forwarding each notification to the owner.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingChannelObserver;

impl ChannelObserver for LoggingChannelObserver {
    fn on_ready(&mut self, remote: SocketAddr) {
        tracing::debug!(%remote, "channel_ready");
    }

    fn on_error(&mut self, code: WorkerManagerErrorCode) {
        tracing::debug!(%code, "channel_error");
    }

    fn on_message(&mut self, command: &str, raw: &str) {
        tracing::debug!(command, len = raw.len(), "channel_message");
    }
}
