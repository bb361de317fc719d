// WebSocket event types for the murmur chat protocol.
//
// Frames are JSON text, adjacently tagged as `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{ChatMessage, RoomUser};

/// Payload field a client must never send; the relay derives the sender itself.
pub const SENDER_FIELD: &str = "sender";

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once, right after the connection is authorized.
    #[serde(rename_all = "camelCase")]
    ConnectionSuccess { messages: Vec<ChatMessage>, users: Vec<RoomUser>, invite_hash: String },

    /// Sent right before the relay closes a rejected connection.
    ConnectionError { message: ConnectionErrorCode },

    /// A message another member of the room sent.
    ReceiveMessage(ChatMessage),

    /// Only ever sent to the connection whose `send_message` failed.
    SendMessageError { message: SendMessageErrorCode },

    /// A new member joined the room through an invite.
    UserJoined(RoomUser),
}

/// Client -> Server events.
///
/// The payload stays untyped so the relay can reject malformed or spoofed
/// payloads with a protocol error instead of dropping the frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage(Value),
}

impl ClientEvent {
    pub fn send_message(text: impl Into<String>) -> Self {
        Self::SendMessage(serde_json::json!({ "text": text.into() }))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorCode {
    NoToken,
    InvalidToken,
    Unauthorized,
    Unavailable,
}

impl ConnectionErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoToken => "no_token",
            Self::InvalidToken => "invalid_token",
            Self::Unauthorized => "unauthorized",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendMessageErrorCode {
    InvalidMessage,
    ChatNotFound,
    InternalError,
}

impl SendMessageErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid_message",
            Self::ChatNotFound => "chat_not_found",
            Self::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("send_message payload must be a JSON object")]
    NotAnObject,
    #[error("send_message payload needs a non-empty `text` string")]
    InvalidText,
    #[error("send_message payload must not carry a `sender` field")]
    SenderNotAllowed,
}

/// Validated body of a `send_message` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessagePayload {
    pub text: String,
}

impl SendMessagePayload {
    pub fn from_value(value: &Value) -> Result<Self, PayloadError> {
        let object = value.as_object().ok_or(PayloadError::NotAnObject)?;

        if object.contains_key(SENDER_FIELD) {
            return Err(PayloadError::SenderNotAllowed);
        }

        match object.get("text").and_then(Value::as_str) {
            Some(text) if !text.is_empty() => Ok(Self { text: text.to_owned() }),
            _ => Err(PayloadError::InvalidText),
        }
    }
}
