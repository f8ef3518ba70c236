//! Courier - reliable outgoing message delivery for real-time chat
//!
//! This crate provides a unified API over the Courier delivery layer.
//!
//! # Example
//!
//! ```ignore
//! use courier::{ClientConfig, DeliveryOrchestrator};
//!
//! courier::init_tracing();
//! let orchestrator = DeliveryOrchestrator::connect(&ClientConfig::from_env()?).await?;
//! let message = orchestrator.send_text("room-1", "user-1", "hello", None).await?;
//! ```

use tracing_subscriber::EnvFilter;

// Re-export client types
pub use courier_client::{
    AttachmentUploader, BlobStore, ClientConfig, ClientDatabase, ClientError, ConnectivityMonitor, DeliveryEvent,
    DeliveryOrchestrator, DeliveryPolicy, Draft, EventDispatcher, EventType, PendingQueueStore, UploadConfig,
    WebSocketTransport,
};

// Re-export core types that applications need
pub use courier_core::errors::{DeliveryError, UploadError};
pub use courier_core::merge::{merge_room_history, MergeOutcome};
pub use courier_core::models::{DeliveryStatus, MessageKind, PendingMessage, ReplyRef, RoomMessage, TimelineEntry};
pub use courier_core::DeliveryResult;

const DEFAULT_LOG_FILTER: &str = "courier_client=info,courier_core=info";

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to info
/// level for the courier crates. Returns false if a subscriber already exists.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_only_installs_once() {
        init_tracing();
        assert!(!init_tracing());
    }
}
