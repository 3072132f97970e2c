//! JSON messages exchanged with the access point and worker managers.
//!
//! Each message is a typed struct whose serde field names match the wire
//! format exactly; [`pack`] and [`unpack`] are the only entry points the
//! channel uses.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PackError, PackResult};
use crate::protocol_constants::{ALLOCATE_COMMAND, HEARTBEAT_COMMAND};
use crate::utils::now_millis;

/// Serializes a message to JSON text.
pub fn pack<T: Serialize>(message: &T) -> PackResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parses JSON text into a message.
pub fn unpack<T: DeserializeOwned>(raw: &str) -> PackResult<T> {
    Ok(serde_json::from_str(raw)?)
}

/// Extracts the mandatory `command` field from a worker-manager message.
///
/// # Errors
///
/// Returns [`PackError::MissingField`] if `command` is absent or empty, and
/// [`PackError::Json`] if the text is not a JSON object with a string command.
pub fn unpack_command(raw: &str) -> PackResult<String> {
    let envelope: MessageEnvelope = unpack(raw)?;
    match envelope.command {
        Some(command) if !command.is_empty() => Ok(command),
        _ => Err(PackError::MissingField("command")),
    }
}

/// Identity of the client inside a session, shared by the request builders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub sid: String,
    pub app_id: String,
    pub uid: u64,
    pub cname: String,
    pub token: String,
}

/// Request asking the access point for worker managers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    pub command: String,
    pub sid: String,
    pub app_id: String,
    pub uid: u64,
    pub token: String,
    pub ts: u64,
    pub seq: u32,
    pub cname: String,
    pub request_id: u64,
}

impl AllocateRequest {
    /// Builds an allocate request stamped with the current time.
    pub fn new(identity: &SessionIdentity, seq: u32, request_id: u64) -> Self {
        Self {
            command: ALLOCATE_COMMAND.to_string(),
            sid: identity.sid.clone(),
            app_id: identity.app_id.clone(),
            uid: identity.uid,
            token: identity.token.clone(),
            ts: now_millis(),
            seq,
            cname: identity.cname.clone(),
            request_id,
        }
    }
}

/// One worker manager offered by the access point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatedServer {
    /// IP literal (hostnames are not resolved).
    pub address: String,
    /// Plain TCP port (0 = not offered). Out-of-range values are rejected
    /// per server, not per response.
    pub tcp: u32,
    /// TLS port (0 = not offered).
    pub tcps: u32,
}

/// Access point answer to an [`AllocateRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AllocateResponse {
    pub sid: String,
    pub ts: u64,
    pub seq: u32,
    pub cname: String,
    pub request_id: u64,
    /// Numeric server code, see [`convert_server_code`](crate::error::convert_server_code).
    pub code: i32,
    pub reason: String,
    pub vid: u64,
    pub server_ts: u64,
    pub worker_token: String,
    pub servers: Vec<AllocatedServer>,
}

/// Keep-alive sent to the connected worker manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub command: String,
    pub app_id: String,
    pub cname: String,
    pub uid: u64,
    pub sid: String,
    pub ts: u64,
    pub request_id: u64,
}

impl HeartbeatRequest {
    /// Builds a heartbeat stamped with the current time.
    pub fn new(identity: &SessionIdentity, request_id: u64) -> Self {
        Self {
            command: HEARTBEAT_COMMAND.to_string(),
            app_id: identity.app_id.clone(),
            cname: identity.cname.clone(),
            uid: identity.uid,
            sid: identity.sid.clone(),
            ts: now_millis(),
            request_id,
        }
    }
}

/// Worker-manager heartbeat answer; `uid` comes back as a string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub command: String,
    pub app_id: String,
    pub cname: String,
    pub uid: String,
    pub sid: String,
    pub ts: u64,
    pub request_id: u64,
}

/// Minimal view of any worker-manager message.
#[derive(Debug, Deserialize)]
struct MessageEnvelope {
    #[serde(default)]
    command: Option<String>,
}
