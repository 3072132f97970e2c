//! Owner notifications emitted by the channel.
//!
//! This module provides:
//! - [`ChannelObserver`] trait the channel reports outcomes through
//! - [`ChannelEvent`], the owned form used when observers forward across tasks

mod observer;

pub use observer::{ChannelObserver, LoggingChannelObserver};

use std::net::SocketAddr;

use serde::Serialize;

use crate::error::WorkerManagerErrorCode;

/// Notifications delivered to the owner of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelEvent {
    /// Connected to a worker manager.
    Ready {
        /// Address of the worker manager.
        remote: SocketAddr,
    },
    /// A failure (or server outcome) the owner must act on.
    Error {
        /// Classified outcome.
        code: WorkerManagerErrorCode,
    },
    /// A worker-manager message with a valid `command`.
    Message {
        /// The message's `command` field.
        command: String,
        /// The full JSON text.
        raw: String,
    },
}
