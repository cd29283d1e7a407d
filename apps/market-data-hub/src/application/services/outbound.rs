//! Outbound Frame Encoding
//!
//! Every frame sent to a client has the shape
//!
//! ```text
//! { "channel": <name>, "payload": { "type": "INIT" | "UPDATE" | "ERROR", "data": ... } }
//! ```
//!
//! Error data is always `{ "code": ..., "message": ... }`.

use serde::Serialize;

use crate::application::ports::OutboundFrame;

/// Channel name used for errors that cannot be tied to a data channel.
pub const ERROR_CHANNEL: &str = "error";

/// Kind of payload carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Snapshot sent once after subscribing.
    Init,
    /// Live update.
    Update,
    /// Error reply.
    Error,
}

/// Client-facing error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody<'a> {
    /// Stable error code.
    pub code: &'a str,
    /// Human-readable description.
    pub message: &'a str,
}

#[derive(Serialize)]
struct Payload<'a, T: ?Sized> {
    #[serde(rename = "type")]
    kind: MessageType,
    data: &'a T,
}

#[derive(Serialize)]
struct Frame<'a, T: ?Sized> {
    channel: &'a str,
    payload: Payload<'a, T>,
}

/// Encode `data` as a frame on `channel`.
///
/// # Errors
///
/// Returns an error if `data` fails to serialize.
pub fn encode<T: Serialize + ?Sized>(
    channel: &str,
    kind: MessageType,
    data: &T,
) -> Result<OutboundFrame, serde_json::Error> {
    let frame = Frame {
        channel,
        payload: Payload { kind, data },
    };
    serde_json::to_string(&frame).map(OutboundFrame::new)
}

/// Encode an error frame on `channel`.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_error(
    channel: &str,
    code: &str,
    message: &str,
) -> Result<OutboundFrame, serde_json::Error> {
    encode(channel, MessageType::Error, &ErrorBody { code, message })
}
