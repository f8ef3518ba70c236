use thiserror::Error;

use crate::models::DeliveryStatus;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Invalid status transition for {temporary_id}: {from} -> {to}")]
    InvalidTransition {
        temporary_id: String,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("Retry refused for {temporary_id}: {reason}")]
    RetryRefused {
        temporary_id: String,
        reason: String,
    },

    #[error("Message {0} was cancelled")]
    Cancelled(String),

    #[error("Attachment rejected: {0}")]
    AttachmentRejected(UploadError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Typed failure reported by the attachment uploader. Never retried by the
/// uploader itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rejected by storage ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("attachment is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("unsupported attachment type: {0}")]
    UnsupportedType(String),
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Serialization(err.to_string())
    }
}

impl From<chrono::ParseError> for DeliveryError {
    fn from(err: chrono::ParseError) -> Self {
        DeliveryError::Serialization(err.to_string())
    }
}
