//! Probe configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use edgelink_core::{pack, AllocateResponse, AllocatedServer, ChannelConfig, SessionIdentity};
use serde::Deserialize;

/// Probe configuration loaded from YAML with environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Channel settings (AP endpoints, transport, TLS).
    pub channel: ChannelConfig,

    /// Application id sent in every request.
    /// Override: `EDGELINK_APP_ID`
    pub app_id: String,

    /// User id inside the session.
    /// Override: `EDGELINK_UID`
    pub uid: u64,

    /// Channel (room) name.
    /// Override: `EDGELINK_CNAME`
    pub cname: String,

    /// Authentication token.
    /// Override: `EDGELINK_TOKEN`
    pub token: String,

    /// Service type requested from the AP.
    pub service_type: String,

    /// Seconds between heartbeats while connected.
    /// Override: `EDGELINK_HEARTBEAT_INTERVAL`
    pub heartbeat_interval_secs: u64,

    /// Seconds to wait before retrying once every server has failed.
    pub retry_delay_secs: u64,

    /// Connect straight to this worker manager, skipping the AP.
    /// Override: `EDGELINK_WORKER_MANAGER`
    pub worker_manager: Option<SocketAddr>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            app_id: String::new(),
            uid: 0,
            cname: "edgelink-probe".to_string(),
            token: String::new(),
            service_type: "probe".to_string(),
            heartbeat_interval_secs: 3,
            retry_delay_secs: 1,
            worker_manager: None,
        }
    }
}

impl ProbeConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies `EDGELINK_*` overrides looked up through `var`.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("EDGELINK_APP_ID") {
            self.app_id = val;
        }

        if let Some(val) = var("EDGELINK_UID") {
            if let Ok(uid) = val.parse() {
                self.uid = uid;
            }
        }

        if let Some(val) = var("EDGELINK_CNAME") {
            self.cname = val;
        }

        if let Some(val) = var("EDGELINK_TOKEN") {
            self.token = val;
        }

        if let Some(val) = var("EDGELINK_AP_DOMAINS") {
            self.channel.domains = val
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(val) = var("EDGELINK_HEARTBEAT_INTERVAL") {
            if let Ok(secs) = val.parse() {
                self.heartbeat_interval_secs = secs;
            }
        }

        if let Some(val) = var("EDGELINK_WORKER_MANAGER") {
            if let Ok(addr) = val.parse() {
                self.worker_manager = Some(addr);
            }
        }
    }

    /// Checks that the configuration can drive a session.
    pub fn validate(&self) -> Result<(), String> {
        if self.app_id.is_empty() {
            return Err("app_id is required".to_string());
        }
        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be greater than zero".to_string());
        }
        if self.worker_manager.is_none() {
            self.channel.validate()?;
        }
        Ok(())
    }

    /// Session identity for a fresh session id.
    pub fn identity(&self, sid: String) -> SessionIdentity {
        SessionIdentity {
            sid,
            app_id: self.app_id.clone(),
            uid: self.uid,
            cname: self.cname.clone(),
            token: self.token.clone(),
        }
    }

    /// Allocate response naming only the direct worker manager, if one is set.
    pub fn direct_response(&self) -> Result<Option<String>> {
        let Some(addr) = self.worker_manager else {
            return Ok(None);
        };
        let tls = self.channel.tls_enabled();
        let response = AllocateResponse {
            servers: vec![AllocatedServer {
                address: addr.ip().to_string(),
                tcp: if tls { 0 } else { u32::from(addr.port()) },
                tcps: if tls { u32::from(addr.port()) } else { 0 },
            }],
            ..Default::default()
        };
        Ok(Some(
            pack(&response).context("Failed to build direct allocate response")?,
        ))
    }
}
