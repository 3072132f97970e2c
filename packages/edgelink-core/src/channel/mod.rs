//! Worker-manager channel.
//!
//! - `config`: channel configuration and AP endpoint resolution
//! - `state`: channel phases
//! - `traits`: injected collaborators (AP client, transports)
//! - `worker_manager_channel`: the state machine

mod config;
mod state;
mod traits;
mod worker_manager_channel;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use config::{ApEndpoints, ChannelConfig};
pub use state::ChannelState;
pub use traits::{
    ApClient, ApEvent, TlsOptions, Transport, TransportFactory, TransportId, WorkerManagerRequest,
};
pub use worker_manager_channel::{ChannelParts, WorkerManagerChannel};
