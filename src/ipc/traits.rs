//! Core traits for the generic IPC infrastructure.

use serde::de::DeserializeOwned;

/// Message parser trait for converting one framed line into messages.
///
/// The framing layer hands each complete newline-delimited unit to the
/// parser; the parser decides how many messages it contains (usually one,
/// possibly zero for keepalive blanks).
///
/// # Example
///
/// ```ignore
/// pub struct LineParser;
///
/// impl MessageParser<MyMessage> for LineParser {
///     fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<MyMessage>> {
///         let msg: MyMessage = serde_json::from_slice(bytes)?;
///         Ok(vec![msg])
///     }
/// }
/// ```
pub trait MessageParser<M: DeserializeOwned>: Send + Sync + 'static {
    /// Parse one framed unit into messages.
    ///
    /// May return an empty vec if the frame is filtered out (e.g. blank
    /// keepalive lines).
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<M>>;
}

/// Marks messages that act as the worker's readiness handshake.
///
/// The connection manager consumes the first such message after a socket
/// connects to flip the channel from `Connected` to `Ready`; it is not
/// republished to subscribers.
pub trait ReadySignal {
    /// Whether this message is the worker's readiness announcement.
    fn is_ready_signal(&self) -> bool;
}
