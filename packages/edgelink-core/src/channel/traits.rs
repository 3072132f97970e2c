//! Collaborator abstractions for the channel.
//!
//! These traits enable dependency injection for testability and modularity.
//! The channel depends on them rather than on sockets or HTTP clients; the
//! tokio implementations live in [`crate::runtime`].

use std::fmt;
use std::net::SocketAddr;

use crate::error::TransportError;
use crate::pool::ConnectType;

use super::config::ApEndpoints;

/// Identifies one transport instance; events from older transports are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport#{}", self.0)
    }
}

/// TLS parameters for a TCP transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// Name the server certificate is validated against.
    pub server_name: String,
}

/// Request for worker-manager addresses, sent through the AP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerManagerRequest {
    /// Generation id echoed back in the matching [`ApEvent`].
    pub request_id: u64,
    /// Service the worker manager should allocate for.
    pub service_type: String,
    /// Request JSON built by the owner (usually an allocate request).
    pub payload: String,
}

/// Answer (or failure) from the AP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApEvent {
    /// Id of the [`WorkerManagerRequest`] this answers.
    pub request_id: u64,
    /// Event kind bits; worker-manager answers carry `AP_FLAG_WORKER_MANAGER`.
    pub flags: u32,
    /// Non-zero when the AP request itself failed.
    pub error: i32,
    /// Response JSON (an allocate response).
    pub payload: String,
}

/// Client for the access point service.
pub trait ApClient: Send {
    /// Replaces the AP endpoints; cancels any in-flight request.
    fn configure(&mut self, endpoints: &ApEndpoints);

    /// Starts a worker-manager request. The answer arrives as an [`ApEvent`].
    fn require_worker_manager(&mut self, request: WorkerManagerRequest);

    /// Abandons any in-flight request.
    fn cancel(&mut self);
}

/// Connection to one worker manager.
///
/// Connection results, errors and inbound messages are reported back to the
/// channel by the driver, tagged with the transport's [`TransportId`].
pub trait Transport: Send {
    /// Starts connecting; completion is reported asynchronously.
    fn connect(&mut self, remote: SocketAddr);

    /// Returns true once the connection is established.
    fn is_connected(&self) -> bool;

    /// Queues one JSON message for sending.
    fn send_message(&mut self, message: &str) -> Result<(), TransportError>;

    /// Address passed to [`connect`](Self::connect), if any.
    fn remote_address(&self) -> Option<SocketAddr>;

    /// TCP or UDP.
    fn kind(&self) -> ConnectType;

    /// Tears the connection down; no further events are reported.
    fn close(&mut self);
}

/// Creates transports for the channel.
pub trait TransportFactory: Send {
    /// Builds an unconnected transport of the given kind.
    fn create(
        &mut self,
        id: TransportId,
        kind: ConnectType,
        tls: Option<TlsOptions>,
    ) -> Box<dyn Transport>;
}
