//! Wire message type and JSON decoder.
//!
//! Every frame on the wire is a single JSON object. Two object shapes carry
//! meaning for the server itself: `{"type": "KEEP_ALIVE"}` refreshes the
//! sending connection's liveness timestamp and is never surfaced to the
//! application, and `{"type": "SOFTWARE_ERROR", "reason": "..."}` is the
//! shape the server synthesises to report connection-level events. Any other
//! object is application data whose schema the embedding application owns.

use serde_json::Value;
use thiserror::Error;

/// Reason string attached to a synthetic item when a frame fails to decode.
pub const DECODE_FAILURE_REASON: &str = "Could not decode message";

/// Reason string attached to a synthetic item when a peer disconnects.
pub const CONNECTION_CLOSED_REASON: &str = "Connection closed";

/// Reason string attached to a synthetic item when a peer stops sending
/// KEEP_ALIVE pulses.
pub const CONNECTION_TIMEOUT_REASON: &str = "Connection timeout";

/// A decoded wire message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// The distinguished liveness pulse. Consumed by the server; never
    /// delivered to the application.
    KeepAlive,
    /// An error report, either synthesised by the server or received on the
    /// wire.
    SoftwareError {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// Any other well-formed JSON object.
    Data(Value),
}

impl Message {
    /// Synthesise an error message carrying `reason`.
    ///
    /// # Examples
    ///
    /// ```
    /// use inlet::message::Message;
    ///
    /// let msg = Message::software_error("Connection closed");
    /// assert!(msg.is_software_error());
    /// ```
    #[must_use]
    pub fn software_error(reason: impl Into<String>) -> Self {
        Self::SoftwareError {
            reason: reason.into(),
        }
    }

    /// Whether this is the KEEP_ALIVE pulse.
    #[must_use]
    pub fn is_keep_alive(&self) -> bool { matches!(self, Self::KeepAlive) }

    /// Whether this is an error report.
    #[must_use]
    pub fn is_software_error(&self) -> bool { matches!(self, Self::SoftwareError { .. }) }
}

/// Errors raised by [`decode_message`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame parsed, but its top-level value is not an object.
    #[error("top-level JSON value is not an object")]
    NotAnObject,
}

/// Decode one frame into a [`Message`].
///
/// Pure: no I/O, no shared state. Objects with an unrecognised or missing
/// `"type"` member decode to [`Message::Data`] so the application sees them
/// unchanged.
///
/// # Errors
///
/// Returns [`DecodeError`] when the bytes are not valid JSON or the
/// top-level value is not an object.
///
/// # Examples
///
/// ```
/// use inlet::message::{Message, decode_message};
///
/// let msg = decode_message(br#"{"type":"KEEP_ALIVE"}"#).expect("decode");
/// assert!(msg.is_keep_alive());
/// ```
pub fn decode_message(bytes: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Some(map) = value.as_object() else {
        return Err(DecodeError::NotAnObject);
    };

    match map.get("type").and_then(Value::as_str) {
        Some("KEEP_ALIVE") => return Ok(Message::KeepAlive),
        Some("SOFTWARE_ERROR") => {
            let reason = map
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            return Ok(Message::SoftwareError { reason });
        }
        _ => {}
    }

    Ok(Message::Data(value))
}
