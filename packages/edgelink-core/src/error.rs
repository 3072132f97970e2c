//! Centralized error types for the Edgelink core library.
//!
//! This module provides:
//! - [`WorkerManagerErrorCode`], the outcome taxonomy reported to the channel owner
//! - [`convert_server_code`], mapping numeric server codes into that taxonomy
//! - Structured `thiserror` types for API misuse, transport and codec failures

use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for logs and owner callbacks.
    fn code(&self) -> &'static str;
}

/// Outcome codes surfaced to the owner of a [`WorkerManagerChannel`](crate::WorkerManagerChannel).
///
/// Network-layer codes (`BindSocket`, `TcpConnection`, `ConnectionSocket`,
/// `ConnectionTimedout`) come from the transport, `Server*` codes come from the
/// access point response or worker-manager messages, and
/// `NoAvailableWorkerManager` signals pool exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerManagerErrorCode {
    NoAvailableWorkerManager,
    BindSocketError,
    TcpConnectionError,
    ConnectionSocketError,
    ConnectionTimedout,
    ConnectionChanged,
    ServerNoError,
    ServerNoCommandError,
    ServerNoTcpError,
    ServerNoIpError,
    ServerInvalidArgumentError,
    ServerNoWorkerRequestError,
    ServerRequestTooFastError,
    ServerTempError,
    ServerError,
}

impl WorkerManagerErrorCode {
    /// Returns true for server-side errors that should engage connection backoff.
    #[must_use]
    pub fn is_transient_server_error(self) -> bool {
        matches!(
            self,
            Self::ServerTempError | Self::ServerError | Self::ServerRequestTooFastError
        )
    }

    /// Returns true for errors raised by the transport layer.
    #[must_use]
    pub fn is_network_error(self) -> bool {
        matches!(
            self,
            Self::BindSocketError
                | Self::TcpConnectionError
                | Self::ConnectionSocketError
                | Self::ConnectionTimedout
        )
    }
}

impl ErrorCode for WorkerManagerErrorCode {
    fn code(&self) -> &'static str {
        match self {
            Self::NoAvailableWorkerManager => "no_available_worker_manager",
            Self::BindSocketError => "bind_socket_error",
            Self::TcpConnectionError => "tcp_connection_error",
            Self::ConnectionSocketError => "connection_socket_error",
            Self::ConnectionTimedout => "connection_timedout",
            Self::ConnectionChanged => "connection_changed",
            Self::ServerNoError => "server_no_error",
            Self::ServerNoCommandError => "server_no_command",
            Self::ServerNoTcpError => "server_no_tcp",
            Self::ServerNoIpError => "server_no_ip",
            Self::ServerInvalidArgumentError => "server_invalid_argument",
            Self::ServerNoWorkerRequestError => "server_no_worker_request",
            Self::ServerRequestTooFastError => "server_request_too_fast",
            Self::ServerTempError => "server_temp_error",
            Self::ServerError => "server_error",
        }
    }
}

impl std::fmt::Display for WorkerManagerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Maps a numeric code from an allocate response into [`WorkerManagerErrorCode`].
///
/// Unrecognized codes default to [`WorkerManagerErrorCode::ServerError`].
#[must_use]
pub fn convert_server_code(code: i32) -> WorkerManagerErrorCode {
    match code {
        0 => WorkerManagerErrorCode::ServerNoError,
        1 => WorkerManagerErrorCode::ServerInvalidArgumentError,
        2 => WorkerManagerErrorCode::ServerNoWorkerRequestError,
        3 => WorkerManagerErrorCode::ServerRequestTooFastError,
        4 => WorkerManagerErrorCode::ServerTempError,
        _ => WorkerManagerErrorCode::ServerError,
    }
}

/// Errors returned synchronously by channel operations (API misuse).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Operation is not valid in the current state.
    #[error("channel not ready (state: {0})")]
    NotReady(&'static str),

    /// No connected transport to send on.
    #[error("channel not connected to a worker manager")]
    NotConnected,

    /// `initialize` has not been called yet.
    #[error("channel not configured")]
    NotConfigured,

    /// The underlying transport refused the message.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The channel runtime task is gone.
    #[error("channel runtime closed")]
    RuntimeClosed,

    /// A runtime collaborator could not be built.
    #[error("runtime setup failed: {0}")]
    Setup(String),
}

impl ErrorCode for ChannelError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotReady(_) => "not_ready",
            Self::NotConnected => "not_connected",
            Self::NotConfigured => "not_configured",
            Self::Transport(_) => "transport_error",
            Self::RuntimeClosed => "runtime_closed",
            Self::Setup(_) => "setup_failed",
        }
    }
}

/// Transport-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport is not connected.
    #[error("transport not connected")]
    NotConnected,

    /// Outbound queue is closed (transport task ended).
    #[error("transport closed")]
    Closed,

    /// I/O error from the socket.
    #[error("I/O error: {0}")]
    Io(String),

    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotConnected => "transport_not_connected",
            Self::Closed => "transport_closed",
            Self::Io(_) => "transport_io",
            Self::Tls(_) => "transport_tls",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// JSON pack/unpack failures.
#[derive(Debug, Error)]
pub enum PackError {
    /// Serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A mandatory field is absent or empty.
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

impl ErrorCode for PackError {
    fn code(&self) -> &'static str {
        match self {
            Self::Json(_) => "json_error",
            Self::MissingField(_) => "missing_field",
        }
    }
}

/// Result alias for packer operations.
pub type PackResult<T> = Result<T, PackError>;

/// Result alias for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
