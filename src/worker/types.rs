use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ipc::error::IpcError;
use crate::ipc::traits::{MessageParser, ReadySignal};

/// Well-known message type tags of the worker protocol.
pub mod tag {
    /// Worker readiness handshake; gates sending
    pub const READY: &str = "ready";
    /// Instruction for the worker to execute
    pub const COMMAND: &str = "command";
    /// Progress or informational update from the worker
    pub const NOTIFICATION: &str = "notification";
    /// Worker-side failure report
    pub const ERROR: &str = "error";
    /// A previously issued command finished
    pub const COMMAND_COMPLETE: &str = "command_complete";
    /// Result of validating user-provided input
    pub const INPUT_VALIDATION: &str = "input_validation";
}

/// One wire message: an application-level tag plus an opaque payload.
///
/// The payload is interpreted by consumers, never by the channel itself.
/// A message is immutable once sent.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Application-level tag (`ready`, `command`, `notification`, ...)
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Opaque payload; absent on the wire means `null`
    #[serde(default)]
    pub data: Value,
}

impl Message {
    /// Create a message with an arbitrary tag.
    #[must_use]
    pub fn new<S: Into<String>>(msg_type: S, data: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
        }
    }

    /// Create a command message for the worker.
    #[must_use]
    pub fn command(data: Value) -> Self {
        Self::new(tag::COMMAND, data)
    }

    /// Check whether this message carries the given tag.
    #[must_use]
    pub fn is_type(&self, msg_type: &str) -> bool {
        self.msg_type == msg_type
    }
}

impl ReadySignal for Message {
    fn is_ready_signal(&self) -> bool {
        self.msg_type == tag::READY
    }
}

/// Parser decoding one framed line into a single worker message.
#[non_exhaustive]
#[derive(Clone)]
pub struct LineParser;

impl MessageParser<Message> for LineParser {
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<Message>> {
        parse_frame(bytes)
    }
}

/// Deserialize one framed line.
///
/// Returns an empty vector for blank or whitespace-only frames (worker
/// keepalives).
pub fn parse_frame(bytes: &[u8]) -> crate::Result<Vec<Message>> {
    let trimmed = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[][..], |start| &bytes[start..]);

    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let message: Message = serde_json::from_slice(trimmed).map_err(IpcError::MessageParse)?;
    Ok(vec![message])
}
