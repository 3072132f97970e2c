//! Fixed protocol constants that should NOT be changed.
//!
//! These values are shared with the access point and worker-manager servers;
//! changing them would break interoperability or the retry contract.

// ─────────────────────────────────────────────────────────────────────────────
// Backoff
// ─────────────────────────────────────────────────────────────────────────────

/// First backoff interval after a transient server error (milliseconds).
pub const BACKOFF_INITIAL_MS: u64 = 4000;

/// Ceiling for the doubling backoff interval (milliseconds).
pub const BACKOFF_MAX_MS: u64 = 30_000;

// ─────────────────────────────────────────────────────────────────────────────
// Connection Supervision
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between connection timeout checks (milliseconds).
pub const CHANNEL_CONNECTION_CHECK_INTERVAL_MS: u64 = 2000;

/// Silence after which a worker-manager connection is considered dead (milliseconds).
pub const CHANNEL_CONNECTION_TIMEDOUT_MS: u64 = 5000;

// ─────────────────────────────────────────────────────────────────────────────
// Access Point
// ─────────────────────────────────────────────────────────────────────────────

/// AP event flag marking a worker-manager address response.
pub const AP_FLAG_WORKER_MANAGER: u32 = 1 << 4;

/// Default AP request path for the HTTP access point client.
pub const DEFAULT_AP_PATH: &str = "/api/v1/worker-manager/allocate";

/// Timeout for a single AP HTTP request (seconds).
pub const AP_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Delays between AP request rounds; the last entry repeats.
pub const AP_RETRY_DELAYS_MS: [u64; 3] = [200, 500, 1000];

/// Default wildcard domain used for worker-manager certificate validation.
pub const DEFAULT_TLS_DOMAIN: &str = "*.edge.sd-rtn.com";

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Command name for the allocate request sent through the AP.
pub const ALLOCATE_COMMAND: &str = "allocate";

/// Command name for worker-manager heartbeats.
pub const HEARTBEAT_COMMAND: &str = "heartbeat";

/// Maximum length of one newline-delimited TCP message (bytes).
pub const MAX_MESSAGE_LENGTH: usize = 64 * 1024;
