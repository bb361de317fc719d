// Core domain types shared across all Murmur crates.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A room member as shown to other members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomUser {
    pub id: Uuid,
    pub name: String,
}

/// A persisted chat message with its resolved sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
    pub sender: Uuid,
}

/// Access/refresh credentials handed to a client after create, join or refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}
