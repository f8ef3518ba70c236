use courier_core::DeliveryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to acquire lock: {0}")]
    LockError(String),

    #[error("Thread safety violation: process_events() must be called on the registration thread")]
    ThreadSafetyViolation,

    #[error("No callbacks registered yet")]
    NoCallbacksRegistered,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::WebSocket(err.to_string())
    }
}

impl From<ClientError> for DeliveryError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Database(e) => DeliveryError::Storage(e.to_string()),
            ClientError::Migration(e) => DeliveryError::Storage(e.to_string()),
            ClientError::Serialization(e) => DeliveryError::Serialization(e.to_string()),
            ClientError::WebSocket(reason) => DeliveryError::Transport(reason),
            other => DeliveryError::InvalidState(other.to_string()),
        }
    }
}
