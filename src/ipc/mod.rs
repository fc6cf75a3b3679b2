//! Core local-socket IPC infrastructure.
//!
//! This module provides generic connection management for a duplex,
//! newline-delimited JSON channel to a sidecar process. It can be
//! specialized for different message vocabularies using traits and the
//! strategy pattern.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: connection lifecycle, bounded reconnection, and
//!   typed event fan-out
//! - [`FrameDecoder`](framing::FrameDecoder): incremental framing of the raw
//!   byte stream into discrete JSON documents
//! - [`Transport`]: injectable connector owned by exactly one manager
//!   instance
//! - [`MessageParser`]: trait for decoding a framed line into messages
//!
//! # Example
//!
//! ```ignore
//! // Define your message type
//! #[derive(Clone, Debug, Deserialize)]
//! struct MyMessage { /* ... */ }
//!
//! let transport = Arc::new(LocalSocketTransport::new(config.socket_path.clone()));
//! let connection = ConnectionManager::new(transport, config, MyParser);
//! connection.connect();
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod traits;
pub mod transport;

pub use connection::{ChannelEvent, ConnectionManager, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "IpcError includes module name for clarity when used outside this module"
)]
pub use error::IpcError;
pub use traits::*;
pub use transport::{LocalSocketTransport, Transport};
