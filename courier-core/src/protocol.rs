use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{MessageKind, PendingMessage, ReplyRef};

/// Payload handed to the transport for a single send attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    /// Idempotency key; identical across every attempt for the same message.
    pub temporary_id: String,
    pub room_id: String,
    pub sender_id: String,
    pub body: Option<String>,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub reply_ref: Option<ReplyRef>,
    pub created_at: DateTime<Utc>,
}

impl From<&PendingMessage> for OutboundMessage {
    fn from(message: &PendingMessage) -> Self {
        Self {
            temporary_id: message.temporary_id.clone(),
            room_id: message.room_id.clone(),
            sender_id: message.sender_id.clone(),
            body: message.body.clone(),
            kind: message.kind.clone(),
            reply_ref: message.reply_ref.clone(),
            created_at: message.created_at,
        }
    }
}

/// Completion reported by the transport for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    pub success: bool,
    pub canonical_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SendAck {
    pub fn accepted(canonical_id: impl Into<String>) -> Self {
        Self {
            success: true,
            canonical_id: Some(canonical_id.into()),
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            canonical_id: None,
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    // Authentication
    Authenticate {
        user_id: String,
        api_key: String,
        signature: String,
        timestamp: i64,
    },

    // Message delivery
    NewMessage {
        message: OutboundMessage,
    },

    // Heartbeat
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    // Authentication responses
    AuthSuccess {
        session_id: String,
    },
    AuthError {
        reason: String,
    },

    // Delivery completion, correlated by temporary id
    MessageAck {
        temporary_id: String,
        ack: SendAck,
    },

    // Errors
    Error {
        code: ErrorCode,
        message: String,
    },

    // Heartbeat
    Pong,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidAuth,
    InvalidPayload,
    RoomNotFound,
    ServerError,
    RateLimitExceeded,
}
