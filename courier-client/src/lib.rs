pub mod blob_store;
pub mod config;
pub mod connectivity;
pub mod database;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod pending_queue;
pub mod queries;
pub mod transport;
pub mod uploader;

pub use blob_store::BlobStore;
pub use config::{ClientConfig, DeliveryPolicy, UploadConfig};
pub use connectivity::ConnectivityMonitor;
pub use database::ClientDatabase;
pub use errors::ClientError;
pub use events::{DeliveryEvent, EventDispatcher, EventType};
pub use orchestrator::{DeliveryOrchestrator, Draft};
pub use pending_queue::PendingQueueStore;
pub use transport::{Transport, WebSocketTransport};
pub use uploader::{AttachmentUploader, HttpObjectStorage, ObjectStorage, UploadObject, UploadedAttachment};

pub type ClientResult<T> = Result<T, ClientError>;
