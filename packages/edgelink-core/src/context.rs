//! Network context: local address family detection and endpoint naming.
//!
//! The pool only hands out servers whose address family matches the local
//! network, so the channel needs to know whether it should ask for IPv4 or IPv6
//! candidates. [`IpFamily::Auto`] asks an [`IpDetector`]; explicit families skip
//! detection entirely (server deployments, tests).

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Address family preference used when selecting a worker manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    /// Detect from the local interface; IPv4 unless only IPv6 is available.
    #[default]
    Auto,
    /// Only select IPv4 servers.
    V4,
    /// Only select IPv6 servers.
    V6,
}

impl IpFamily {
    /// Resolves the preference to the `ipv4` flag passed to the selector.
    ///
    /// Detection failures fall back to IPv4, which is what every AP deployment
    /// hands out first.
    #[must_use]
    pub fn prefers_ipv4(self, detector: &dyn IpDetector) -> bool {
        match self {
            Self::V4 => true,
            Self::V6 => false,
            Self::Auto => match detector.detect() {
                Ok(ip) => ip.is_ipv4(),
                Err(e) => {
                    log::warn!("[Context] Local IP detection failed, assuming IPv4: {}", e);
                    true
                }
            },
        }
    }
}

/// Trait for detecting the local IP address.
///
/// Different environments may need different detection strategies.
/// This trait allows injecting the appropriate detector.
pub trait IpDetector: Send + Sync {
    /// Detects the local IP address.
    fn detect(&self) -> Result<IpAddr, NetworkError>;
}

/// Default IP detector using the system's network interfaces.
///
/// Tries IPv4 first and falls back to IPv6 for IPv6-only hosts.
#[derive(Debug, Clone, Default)]
pub struct LocalIpDetector;

impl LocalIpDetector {
    /// Creates a new `LocalIpDetector`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Creates a new `LocalIpDetector` wrapped in an Arc.
    #[must_use]
    pub fn arc() -> Arc<dyn IpDetector> {
        Arc::new(Self::new())
    }
}

impl IpDetector for LocalIpDetector {
    fn detect(&self) -> Result<IpAddr, NetworkError> {
        local_ip_address::local_ip()
            .or_else(|_| local_ip_address::local_ipv6())
            .map_err(|e| NetworkError::Detection(e.to_string()))
    }
}

/// Errors that can occur during network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Could not detect local IP address.
    #[error("Failed to detect local IP: {0}")]
    Detection(String),
}

/// Builds the certificate name for a worker manager reached by IP.
///
/// Worker managers present a wildcard certificate; the concrete name replaces
/// the leading `*` with the dashed IP (`*.edge.example` + `1.2.3.4` →
/// `1-2-3-4.edge.example`). Patterns without a wildcard are used verbatim.
#[must_use]
pub fn tls_server_name(wildcard_domain: &str, ip: IpAddr) -> String {
    match wildcard_domain.strip_prefix('*') {
        Some(suffix) => {
            let label = ip.to_string().replace(['.', ':'], "-");
            format!("{label}{suffix}")
        }
        None => wildcard_domain.to_string(),
    }
}

/// Builder for access point request URLs.
pub struct ApUrlBuilder {
    scheme: String,
    path: String,
}

impl ApUrlBuilder {
    /// Creates a new `ApUrlBuilder` for the given scheme and request path.
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
        }
    }

    /// Returns the request URL for one AP host and port.
    ///
    /// IPv6 literals are bracketed.
    #[must_use]
    pub fn url(&self, host: &str, port: u16) -> String {
        let host = match host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
            _ => host.to_string(),
        };
        format!("{}://{}:{}{}", self.scheme, host, port, self.path)
    }
}
