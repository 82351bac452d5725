//! Hello handshake validation
//!
//! Every session must open with a `CONN:HELLO` envelope:
//!
//! ```text
//! {"message": {"messageId": 1, "messageType": "CONN:HELLO", "requiresResponse": false, ...}}
//! ```
//!
//! Only the three fields below are checked. Everything else in the envelope
//! is opaque and the frame is later forwarded to the peer exactly as received.

use std::fmt;

use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Message;

// ============================================================================
// Constants
// ============================================================================

/// Required `messageType` of the first frame on every session
pub const HELLO_MESSAGE_TYPE: &str = "CONN:HELLO";

// ============================================================================
// Types
// ============================================================================

/// A validated hello, cached on the session until it is relayed
#[derive(Debug, Clone, PartialEq)]
pub struct HelloEnvelope {
    pub message_id: i64,
    pub message_type: String,
    pub requires_response: bool,
    /// Parsed envelope (for logging)
    pub body: Value,
    /// The frame as received
    pub frame: Message,
}

/// Reasons a first frame is not an acceptable hello
#[derive(Debug, Clone, PartialEq)]
pub enum HelloError {
    /// Binary frame whose payload is not UTF-8
    NotUtf8,
    /// Payload is not parseable JSON
    NotJson(String),
    /// JSON parsed, but is not a non-empty object
    NotAnObject,
    /// A required field is absent
    MissingField(&'static str),
    /// A required field has the wrong JSON type
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    /// Well-formed envelope with a `messageType` other than `CONN:HELLO`
    NotHello(String),
}

impl fmt::Display for HelloError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HelloError::NotUtf8 => write!(f, "message is not valid UTF-8"),
            HelloError::NotJson(msg) => write!(f, "message does not appear to be json: {}", msg),
            HelloError::NotAnObject => write!(f, "message is not a json object"),
            HelloError::MissingField(field) => {
                write!(f, "message doesn't contain a '{}' field", field)
            }
            HelloError::WrongType { field, expected } => {
                write!(f, "field type for '{}' field is not {}", field, expected)
            }
            HelloError::NotHello(found) => write!(
                f,
                "message does not appear to be a {} message (found {})",
                HELLO_MESSAGE_TYPE, found
            ),
        }
    }
}

impl std::error::Error for HelloError {}

// ============================================================================
// Validation
// ============================================================================

/// Validate the first data frame of a session.
///
/// Text frames and binary frames carrying UTF-8 JSON are both accepted.
pub fn validate_hello(frame: &Message) -> Result<HelloEnvelope, HelloError> {
    let text = match frame {
        Message::Text(text) => text.as_str(),
        Message::Binary(data) => std::str::from_utf8(data).map_err(|_| HelloError::NotUtf8)?,
        _ => return Err(HelloError::NotJson("not a data frame".to_string())),
    };

    let body: Value =
        serde_json::from_str(text).map_err(|e| HelloError::NotJson(e.to_string()))?;

    let envelope = match &body {
        Value::Object(map) if !map.is_empty() => map,
        _ => return Err(HelloError::NotAnObject),
    };

    let message = match require(envelope, "message")? {
        Value::Object(map) => map,
        _ => {
            return Err(HelloError::WrongType {
                field: "message",
                expected: "an object",
            })
        }
    };

    let message_id = require(message, "messageId")?
        .as_i64()
        .ok_or(HelloError::WrongType {
            field: "messageId",
            expected: "an integer",
        })?;

    let message_type = require(message, "messageType")?
        .as_str()
        .ok_or(HelloError::WrongType {
            field: "messageType",
            expected: "a string",
        })?
        .to_string();

    let requires_response = require(message, "requiresResponse")?
        .as_bool()
        .ok_or(HelloError::WrongType {
            field: "requiresResponse",
            expected: "a boolean",
        })?;

    if message_type != HELLO_MESSAGE_TYPE {
        return Err(HelloError::NotHello(message_type));
    }

    Ok(HelloEnvelope {
        message_id,
        message_type,
        requires_response,
        body,
        frame: frame.clone(),
    })
}

fn require<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, HelloError> {
    obj.get(field).ok_or(HelloError::MissingField(field))
}

// ============================================================================
// Tests
// ============================================================================
