use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::errors::DeliveryError;
use crate::DeliveryResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    /// Allowed edges: pending -> sent, pending -> failed, failed -> pending.
    /// Removal (cancellation, promotion out of the queue) is not a status.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (DeliveryStatus::Pending, DeliveryStatus::Sent)
                | (DeliveryStatus::Pending, DeliveryStatus::Failed)
                | (DeliveryStatus::Failed, DeliveryStatus::Pending)
        )
    }
}

/// Upload state shared by every attachment kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub mime_type: String,
    pub size: u64,
    /// Durable object-storage URL, set once the upload succeeded.
    pub url: Option<String>,
    /// True while the raw bytes live only in the local blob store.
    pub raw_bytes_pending: bool,
}

impl Attachment {
    pub fn staged(mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            mime_type: mime_type.into(),
            size,
            url: None,
            raw_bytes_pending: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceAttachment {
    pub attachment: Attachment,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileAttachment {
    pub attachment: Attachment,
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Voice(VoiceAttachment),
    File(FileAttachment),
}

impl MessageKind {
    pub fn attachment(&self) -> Option<&Attachment> {
        match self {
            MessageKind::Text => None,
            MessageKind::Voice(voice) => Some(&voice.attachment),
            MessageKind::File(file) => Some(&file.attachment),
        }
    }

    pub fn attachment_mut(&mut self) -> Option<&mut Attachment> {
        match self {
            MessageKind::Text => None,
            MessageKind::Voice(voice) => Some(&mut voice.attachment),
            MessageKind::File(file) => Some(&mut file.attachment),
        }
    }

    /// File name handed to object storage for this attachment.
    pub fn upload_name(&self, temporary_id: &str) -> String {
        match self {
            MessageKind::File(file) => file.file_name.clone(),
            MessageKind::Voice(_) => format!("voice-{}.ogg", temporary_id),
            MessageKind::Text => temporary_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyRef {
    pub message_id: String,
    pub snippet: String,
    pub username: String,
}

/// Durable outgoing state for one user-authored message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMessage {
    pub temporary_id: String,
    /// Equals `temporary_id` until the server acknowledges.
    pub canonical_id: String,
    pub room_id: String,
    pub sender_id: String,
    pub body: Option<String>,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub reply_ref: Option<ReplyRef>,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub upload_progress: Option<u8>,
    pub retry_count: u32,
    pub first_attempt_at: Option<DateTime<Utc>>,
}

impl PendingMessage {
    pub fn new(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: Option<String>,
        kind: MessageKind,
        reply_ref: Option<ReplyRef>,
    ) -> Self {
        let temporary_id = Uuid::new_v4().to_string();
        let upload_progress = kind.attachment().map(|_| 0);
        Self {
            canonical_id: temporary_id.clone(),
            temporary_id,
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            body,
            kind,
            reply_ref,
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
            upload_progress,
            retry_count: 0,
            first_attempt_at: None,
        }
    }

    pub fn transition_to(&mut self, next: DeliveryStatus) -> DeliveryResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DeliveryError::InvalidTransition {
                temporary_id: self.temporary_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// An attachment whose durable URL is still missing.
    pub fn awaiting_upload(&self) -> bool {
        self.kind
            .attachment()
            .map(|attachment| attachment.url.is_none())
            .unwrap_or(false)
    }

    pub fn holds_blob(&self) -> bool {
        self.kind.attachment().is_some()
    }

    pub fn record_upload(&mut self, url: String) {
        if let Some(attachment) = self.kind.attachment_mut() {
            attachment.url = Some(url);
            attachment.raw_bytes_pending = false;
        }
        self.upload_progress = Some(100);
    }

    pub fn is_acknowledged(&self) -> bool {
        self.status == DeliveryStatus::Sent
    }
}

/// Raw attachment bytes staged locally under a message's temporary id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub key: String,
    pub bytes: Vec<u8>,
    pub size: u64,
    pub mime_type: String,
    pub saved_at: DateTime<Utc>,
}

/// A message as it exists in the server-authoritative room history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomMessage {
    pub id: String,
    /// Idempotency key echoed back by the server for client-originated messages.
    pub temporary_id: Option<String>,
    pub room_id: String,
    pub sender_id: String,
    pub body: Option<String>,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub reply_ref: Option<ReplyRef>,
    pub created_at: DateTime<Utc>,
}

impl RoomMessage {
    pub fn matches(&self, temporary_id: &str) -> bool {
        self.id == temporary_id || self.temporary_id.as_deref() == Some(temporary_id)
    }
}

/// One displayable row of a room after reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Confirmed(RoomMessage),
    Local(PendingMessage),
}

impl TimelineEntry {
    pub fn id(&self) -> &str {
        match self {
            TimelineEntry::Confirmed(message) => &message.id,
            TimelineEntry::Local(message) => &message.canonical_id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::Confirmed(message) => message.created_at,
            TimelineEntry::Local(message) => message.created_at,
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        match self {
            TimelineEntry::Confirmed(_) => DeliveryStatus::Sent,
            TimelineEntry::Local(message) => message.status,
        }
    }
}
