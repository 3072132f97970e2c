//! Channel configuration.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::context::IpFamily;
use crate::pool::ConnectType;
use crate::protocol_constants::{DEFAULT_AP_PATH, DEFAULT_TLS_DOMAIN};

/// Configuration passed to `WorkerManagerChannel::initialize`.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    // Access point
    /// AP domains, tried in order.
    pub domains: Vec<String>,

    /// Ports tried for every AP host.
    pub default_ports: Vec<u16>,

    /// Fixed AP IPs; when set they replace `domains`.
    pub fixed_ips: Vec<IpAddr>,

    /// Port for `fixed_ips`; falls back to `default_ports`.
    pub fixed_port: Option<u16>,

    /// `http` or `https`.
    pub ap_scheme: String,

    /// Request path on the AP.
    pub ap_path: String,

    // Worker manager
    /// Transport used to reach worker managers.
    pub connect_type: ConnectType,

    /// Use the TLS port and wrap TCP in TLS.
    pub use_tls: bool,

    /// Wildcard certificate domain of worker managers.
    pub tls_domain: String,

    /// Address family of the worker managers to select.
    pub ip_family: IpFamily,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            default_ports: vec![443],
            fixed_ips: Vec::new(),
            fixed_port: None,
            ap_scheme: "https".to_string(),
            ap_path: DEFAULT_AP_PATH.to_string(),
            connect_type: ConnectType::Tcp,
            use_tls: false,
            tls_domain: DEFAULT_TLS_DOMAIN.to_string(),
            ip_family: IpFamily::Auto,
        }
    }
}

impl ChannelConfig {
    /// Resolves the AP hosts and ports to try.
    ///
    /// Fixed IPs take precedence over domains.
    #[must_use]
    pub fn ap_endpoints(&self) -> ApEndpoints {
        if self.fixed_ips.is_empty() {
            ApEndpoints {
                hosts: self.domains.clone(),
                ports: self.default_ports.clone(),
                scheme: self.ap_scheme.clone(),
                path: self.ap_path.clone(),
            }
        } else {
            ApEndpoints {
                hosts: self.fixed_ips.iter().map(ToString::to_string).collect(),
                ports: self
                    .fixed_port
                    .map(|p| vec![p])
                    .unwrap_or_else(|| self.default_ports.clone()),
                scheme: self.ap_scheme.clone(),
                path: self.ap_path.clone(),
            }
        }
    }

    /// Returns true if `other` would produce the same worker-manager candidates.
    ///
    /// When this holds, re-initializing keeps the pool and its failure history.
    #[must_use]
    pub fn same_server_source(&self, other: &Self) -> bool {
        self.connect_type == other.connect_type
            && self.use_tls == other.use_tls
            && self.ap_endpoints() == other.ap_endpoints()
    }

    /// TLS applies only to TCP connections.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.use_tls && self.connect_type == ConnectType::Tcp
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        let endpoints = self.ap_endpoints();
        if endpoints.hosts.is_empty() {
            return Err("at least one AP domain or fixed IP is required".to_string());
        }
        if endpoints.ports.is_empty() || endpoints.ports.contains(&0) {
            return Err("AP ports must be non-empty and non-zero".to_string());
        }
        if self.ap_scheme != "http" && self.ap_scheme != "https" {
            return Err(format!("unsupported AP scheme: {}", self.ap_scheme));
        }
        if self.use_tls && self.tls_domain.is_empty() {
            return Err("tls_domain is required when use_tls is set".to_string());
        }
        Ok(())
    }
}

/// Resolved AP hosts and ports handed to the AP client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApEndpoints {
    pub hosts: Vec<String>,
    pub ports: Vec<u16>,
    pub scheme: String,
    pub path: String,
}
