//! Solver worker client layered on the IPC infrastructure.
//!
//! The sidecar worker speaks newline-delimited JSON messages of the shape
//! `{"type": <string>, "data": <any>}` over a local domain socket. This
//! module binds the generic [`ConnectionManager`](crate::ipc::ConnectionManager)
//! to that vocabulary and exposes the client the rest of the application
//! depends on.
//!
//! # Example
//!
//! ```rust,no_run
//! use solver_sidecar_client::ipc::config::Config;
//! use solver_sidecar_client::worker::{Client, Message};
//! use futures::StreamExt;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new(Config::default());
//!     client.connect();
//!     client.wait_until_ready(Duration::from_secs(10)).await?;
//!
//!     client.send(Message::command(serde_json::json!({"action": "solve"})));
//!
//!     let mut messages = Box::pin(client.messages());
//!     while let Some(message) = messages.next().await {
//!         println!("worker says: {:?}", message?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod types;

// Re-export commonly used types
pub use client::Client;
pub use types::{LineParser, Message, parse_frame, tag};
