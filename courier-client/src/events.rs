//! Delivery event notifications for the UI layer
//!
//! The orchestrator emits events from whichever task is driving a message.
//! Events are queued and only handed to callbacks when the owning thread calls
//! [`EventDispatcher::process_events`], so UI code never has to synchronise
//! against delivery tasks.
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_client::events::{DeliveryEvent, EventDispatcher};
//!
//! let dispatcher = EventDispatcher::new();
//!
//! dispatcher.register_callback(|event| {
//!     if let DeliveryEvent::MessageSent { temporary_id, canonical_id, .. } = event {
//!         println!("{} is now {}", temporary_id, canonical_id);
//!     }
//! }).unwrap();
//!
//! // In the UI loop
//! dispatcher.process_events().unwrap();
//! ```

use crate::errors::ClientError;
use crate::ClientResult;
use courier_core::models::PendingMessage;
use std::sync::{mpsc, Mutex};
use std::thread::{self, ThreadId};

/// Event categories, usable as callback filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    MessageQueued,
    UploadProgress,
    AttemptFailed,
    MessageSent,
    MessageFailed,
    MessageRetrying,
    MessageCancelled,
    MessageReaped,
    ConnectivityChanged,
    StorageError,
}

#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    /// A message was staged locally and is now `pending`
    MessageQueued { message: PendingMessage },
    /// Attachment upload progress, 0-100
    UploadProgress { temporary_id: String, progress: u8 },
    /// One attempt failed below the deadline; a retry is scheduled
    AttemptFailed {
        temporary_id: String,
        attempt: u32,
        reason: String,
    },
    /// The server acknowledged the message; the displayed row keeps its place
    /// and swaps to the canonical id
    MessageSent {
        temporary_id: String,
        room_id: String,
        canonical_id: String,
    },
    /// The delivery deadline elapsed
    MessageFailed {
        temporary_id: String,
        room_id: String,
        retry_count: u32,
    },
    /// A failed message was manually put back to `pending`
    MessageRetrying { temporary_id: String },
    /// The message was cancelled and must disappear from the UI
    MessageCancelled { temporary_id: String, room_id: String },
    /// A local record turned out to already be in server history
    MessageReaped {
        temporary_id: String,
        canonical_id: String,
    },
    ConnectivityChanged { online: bool },
    StorageError { operation: String, message: String },
}

impl DeliveryEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            DeliveryEvent::MessageQueued { .. } => EventType::MessageQueued,
            DeliveryEvent::UploadProgress { .. } => EventType::UploadProgress,
            DeliveryEvent::AttemptFailed { .. } => EventType::AttemptFailed,
            DeliveryEvent::MessageSent { .. } => EventType::MessageSent,
            DeliveryEvent::MessageFailed { .. } => EventType::MessageFailed,
            DeliveryEvent::MessageRetrying { .. } => EventType::MessageRetrying,
            DeliveryEvent::MessageCancelled { .. } => EventType::MessageCancelled,
            DeliveryEvent::MessageReaped { .. } => EventType::MessageReaped,
            DeliveryEvent::ConnectivityChanged { .. } => EventType::ConnectivityChanged,
            DeliveryEvent::StorageError { .. } => EventType::StorageError,
        }
    }
}

struct CallbackEntry {
    callback: Box<dyn Fn(DeliveryEvent) + Send>,
    event_filter: Option<EventType>,
}

pub struct EventDispatcher {
    callbacks: Mutex<Vec<CallbackEntry>>,
    event_queue: Mutex<mpsc::Receiver<DeliveryEvent>>,
    event_sender: mpsc::Sender<DeliveryEvent>,
    callback_thread_id: Mutex<Option<ThreadId>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            callbacks: Mutex::new(Vec::new()),
            event_queue: Mutex::new(receiver),
            event_sender: sender,
            callback_thread_id: Mutex::new(None),
        }
    }

    fn ensure_callback_thread(&self) -> ClientResult<()> {
        let mut thread_id = self
            .callback_thread_id
            .lock()
            .map_err(|_| ClientError::LockError("thread ID".into()))?;
        if thread_id.is_none() {
            *thread_id = Some(thread::current().id());
            tracing::info!(
                "Delivery callbacks will be processed on thread: {:?}",
                thread::current().id()
            );
        }
        Ok(())
    }

    pub fn register_callback<F>(&self, callback: F) -> ClientResult<()>
    where
        F: Fn(DeliveryEvent) + Send + 'static,
    {
        self.register(Box::new(callback), None)
    }

    pub fn register_callback_filtered<F>(&self, callback: F, event_filter: EventType) -> ClientResult<()>
    where
        F: Fn(DeliveryEvent) + Send + 'static,
    {
        self.register(Box::new(callback), Some(event_filter))
    }

    fn register(
        &self,
        callback: Box<dyn Fn(DeliveryEvent) + Send>,
        event_filter: Option<EventType>,
    ) -> ClientResult<()> {
        self.ensure_callback_thread()?;

        let mut callbacks = self
            .callbacks
            .lock()
            .map_err(|_| ClientError::LockError("callbacks".into()))?;
        callbacks.push(CallbackEntry {
            callback,
            event_filter,
        });
        Ok(())
    }

    pub fn emit(&self, event: DeliveryEvent) {
        if self.event_sender.send(event).is_err() {
            tracing::error!("Failed to queue delivery event - receiver dropped");
        }
    }

    pub fn emit_queued(&self, message: &PendingMessage) {
        self.emit(DeliveryEvent::MessageQueued {
            message: message.clone(),
        });
    }

    pub fn emit_upload_progress(&self, temporary_id: &str, progress: u8) {
        self.emit(DeliveryEvent::UploadProgress {
            temporary_id: temporary_id.to_string(),
            progress,
        });
    }

    pub fn emit_attempt_failed(&self, temporary_id: &str, attempt: u32, reason: &str) {
        self.emit(DeliveryEvent::AttemptFailed {
            temporary_id: temporary_id.to_string(),
            attempt,
            reason: reason.to_string(),
        });
    }

    pub fn emit_sent(&self, message: &PendingMessage) {
        self.emit(DeliveryEvent::MessageSent {
            temporary_id: message.temporary_id.clone(),
            room_id: message.room_id.clone(),
            canonical_id: message.canonical_id.clone(),
        });
    }

    pub fn emit_failed(&self, message: &PendingMessage) {
        self.emit(DeliveryEvent::MessageFailed {
            temporary_id: message.temporary_id.clone(),
            room_id: message.room_id.clone(),
            retry_count: message.retry_count,
        });
    }

    pub fn emit_retrying(&self, temporary_id: &str) {
        self.emit(DeliveryEvent::MessageRetrying {
            temporary_id: temporary_id.to_string(),
        });
    }

    pub fn emit_cancelled(&self, temporary_id: &str, room_id: &str) {
        self.emit(DeliveryEvent::MessageCancelled {
            temporary_id: temporary_id.to_string(),
            room_id: room_id.to_string(),
        });
    }

    pub fn emit_reaped(&self, temporary_id: &str, canonical_id: &str) {
        self.emit(DeliveryEvent::MessageReaped {
            temporary_id: temporary_id.to_string(),
            canonical_id: canonical_id.to_string(),
        });
    }

    pub fn emit_connectivity_changed(&self, online: bool) {
        self.emit(DeliveryEvent::ConnectivityChanged { online });
    }

    pub fn emit_storage_error(&self, operation: &str, message: &str) {
        self.emit(DeliveryEvent::StorageError {
            operation: operation.to_string(),
            message: message.to_string(),
        });
    }

    /// Drain queued events into the registered callbacks. Must be called on the
    /// thread that registered them.
    pub fn process_events(&self) -> ClientResult<usize> {
        {
            let thread_id = self
                .callback_thread_id
                .lock()
                .map_err(|_| ClientError::LockError("thread ID".into()))?;
            match *thread_id {
                Some(expected) if expected != thread::current().id() => {
                    return Err(ClientError::ThreadSafetyViolation)
                }
                Some(_) => {}
                None => return Err(ClientError::NoCallbacksRegistered),
            }
        }

        let callbacks = self
            .callbacks
            .lock()
            .map_err(|_| ClientError::LockError("callbacks".into()))?;
        let receiver = self
            .event_queue
            .lock()
            .map_err(|_| ClientError::LockError("event queue".into()))?;

        let mut processed_count = 0;
        while let Ok(event) = receiver.try_recv() {
            let event_type = event.event_type();
            for entry in callbacks.iter() {
                if let Some(filter) = entry.event_filter {
                    if filter != event_type {
                        continue;
                    }
                }
                (entry.callback)(event.clone());
            }
            processed_count += 1;
        }

        Ok(processed_count)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
