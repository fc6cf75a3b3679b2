#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Well-known socket path the sidecar worker listens on.
#[cfg(unix)]
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/solver-worker.sock";
/// Well-known pipe name the sidecar worker listens on.
#[cfg(windows)]
pub const DEFAULT_SOCKET_PATH: &str = "solver-worker.sock";

/// Configuration for the sidecar IPC channel.
///
/// The socket path and framing limits are passed explicitly at construction;
/// there is no process-wide transport configuration.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem path (Unix) or namespaced pipe name (Windows) of the
    /// worker's local socket
    pub socket_path: String,
    /// Maximum time to wait for a single connection attempt to complete
    pub connect_timeout: Duration,
    /// Upper bound on a single framed message; longer frames are discarded
    pub max_frame_bytes: usize,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_owned(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Configuration pointing at a specific socket path, with defaults for
    /// everything else.
    #[must_use]
    pub fn for_socket<S: Into<String>>(socket_path: S) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The default is the bounded fixed-delay policy: one retry per second, up
/// to three consecutive failures, then permanent shutdown. Setting
/// `multiplier` above 1.0 turns the fixed delay into exponential backoff.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_RETRY_ATTEMPTS),
            initial_delay: DEFAULT_RETRY_DELAY_DURATION,
            max_delay: DEFAULT_RETRY_DELAY_DURATION,
            multiplier: 1.0,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_delay)
            .with_max_interval(config.max_delay)
            .with_multiplier(config.multiplier)
            // Deterministic delays; the attempt ceiling is enforced separately
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}
