#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use crate::ipc::connection::ConnectionState;

/// IPC channel error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum IpcError {
    /// Error connecting to the worker's local socket
    Connect(std::io::Error),
    /// Error parsing a framed message
    MessageParse(serde_json::Error),
    /// The worker closed the connection
    ConnectionClosed,
    /// Operation requires the channel to be ready
    NotReady {
        /// State the channel was observed in
        state: ConnectionState,
    },
    /// The channel is permanently stopped
    Stopped,
    /// Operation timed out
    Timeout,
    /// Subscription lagged and missed messages
    Lagged {
        /// Number of messages that were missed
        count: u64,
    },
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "failed to connect to worker socket: {e}"),
            Self::MessageParse(e) => write!(f, "failed to parse worker message: {e}"),
            Self::ConnectionClosed => write!(f, "worker closed the connection"),
            Self::NotReady { state } => {
                write!(f, "channel is not ready (current state: {state})")
            }
            Self::Stopped => write!(f, "channel is permanently stopped"),
            Self::Timeout => write!(f, "IPC operation timed out"),
            Self::Lagged { count } => write!(f, "subscription lagged, missed {count} messages"),
        }
    }
}

impl StdError for IpcError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connect(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<IpcError> for crate::error::Error {
    fn from(e: IpcError) -> Self {
        let kind = match e {
            IpcError::Timeout => crate::error::Kind::Timeout,
            _ => crate::error::Kind::Ipc,
        };
        crate::error::Error::with_source(kind, e)
    }
}
