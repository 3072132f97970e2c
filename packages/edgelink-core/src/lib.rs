//! Edgelink Core - worker-manager connection layer.
//!
//! This crate keeps a client connected to one of a fleet of worker-manager
//! servers. An access point (AP) hands out candidate servers; the channel
//! picks one, connects over TCP (optionally TLS) or UDP, watches it for
//! silence and reports failures so the owner can move on to the next one.
//!
//! # Architecture
//!
//! - [`pool`]: server pool with priority, backoff and timeout eviction
//! - [`strategy`]: backoff gate for AP requests after transient server errors
//! - [`channel`]: the connection state machine
//! - [`packer`]: JSON messages exchanged with the AP and worker managers
//! - [`events`]: owner notifications
//! - [`runtime`]: tokio driver (timers, transports, AP clients)
//! - [`error`]: error codes and error types
//!
//! # Abstraction Traits
//!
//! The channel never blocks, locks or spawns. Its collaborators are traits:
//!
//! - [`TimerService`](timer::TimerService): one-shot timers
//! - [`ApClient`](channel::ApClient): access point requests
//! - [`TransportFactory`](channel::TransportFactory): worker-manager connections
//! - [`ChannelObserver`](events::ChannelObserver): owner callbacks
//! - [`Clock`](utils::Clock) and [`IpDetector`](context::IpDetector)
//!
//! [`runtime`] provides tokio implementations; tests use recording fakes.

#![warn(clippy::all)]

pub mod channel;
pub mod context;
pub mod error;
pub mod events;
pub mod packer;
pub mod pool;
pub mod protocol_constants;
pub mod runtime;
pub mod strategy;
pub mod timer;
pub mod utils;

// Re-export commonly used types at the crate root
pub use channel::{
    ApClient, ApEndpoints, ApEvent, ChannelConfig, ChannelParts, ChannelState, TlsOptions,
    Transport, TransportFactory, TransportId, WorkerManagerChannel, WorkerManagerRequest,
};
pub use context::{IpDetector, IpFamily, LocalIpDetector, NetworkError};
pub use error::{
    convert_server_code, ChannelError, ChannelResult, ErrorCode, PackError, PackResult,
    TransportError, WorkerManagerErrorCode,
};
pub use events::{ChannelEvent, ChannelObserver, LoggingChannelObserver};
pub use packer::{
    pack, unpack, unpack_command, AllocateRequest, AllocateResponse, AllocatedServer,
    HeartbeatRequest, HeartbeatResponse, SessionIdentity,
};
pub use pool::{ConnectType, Server, WorkerManagerSelector};
pub use runtime::{
    ApMode, ChannelHandle, ChannelRuntime, ChannelStatus, RuntimeOptions, TokioClock,
    TokioSpawner,
};
pub use strategy::ConnectionStrategy;
pub use timer::{TimerId, TimerService};
pub use utils::{now_millis, Clock};
