//! Delivery orchestration for outgoing messages
//!
//! Every user-authored message is persisted as `pending` before any network
//! work, then driven by exactly one task per temporary id until it is
//! acknowledged, its delivery window closes, or the user cancels it.
//!
//! ```text
//!   submit ──► pending ──ack──► sent (removed from the queue)
//!                │  ▲
//!       deadline │  │ retry
//!                ▼  │
//!               failed
//!
//!   pending / failed ──cancel──► deleted (tombstoned)
//! ```
//!
//! Queue and blob reads that feed the session state, and every write for a
//! message, happen while holding the shared state lock and only while the
//! message is still live. A cancellation can therefore never be undone by a
//! late upload result or ack.

use crate::blob_store::BlobStore;
use crate::config::{ClientConfig, DeliveryPolicy};
use crate::connectivity::ConnectivityMonitor;
use crate::database::ClientDatabase;
use crate::errors::ClientError;
use crate::events::EventDispatcher;
use crate::pending_queue::PendingQueueStore;
use crate::transport::{Transport, TransportCredentials, WebSocketTransport};
use crate::uploader::{AttachmentUploader, HttpObjectStorage};
use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::Utc;
use courier_core::merge::merge_room_history;
use courier_core::models::{
    Attachment, DeliveryStatus, FileAttachment, MessageKind, PendingMessage, ReplyRef, RoomMessage,
    TimelineEntry, VoiceAttachment,
};
use courier_core::protocol::OutboundMessage;
use courier_core::{DeliveryError, DeliveryResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

/// A message as composed by the user, before it is staged.
#[derive(Debug, Clone)]
pub enum Draft {
    Text {
        room_id: String,
        sender_id: String,
        body: String,
        reply_ref: Option<ReplyRef>,
    },
    Voice {
        room_id: String,
        sender_id: String,
        bytes: Vec<u8>,
        mime_type: String,
        duration_secs: f64,
        reply_ref: Option<ReplyRef>,
    },
    File {
        room_id: String,
        sender_id: String,
        bytes: Vec<u8>,
        mime_type: String,
        file_name: String,
        caption: Option<String>,
        reply_ref: Option<ReplyRef>,
    },
}

struct StagedBytes {
    bytes: Vec<u8>,
    mime_type: String,
}

impl Draft {
    fn stage(self) -> DeliveryResult<(PendingMessage, Option<StagedBytes>)> {
        match self {
            Draft::Text {
                room_id,
                sender_id,
                body,
                reply_ref,
            } => {
                if body.trim().is_empty() {
                    return Err(DeliveryError::InvalidState("message body is empty".into()));
                }
                let message = PendingMessage::new(room_id, sender_id, Some(body), MessageKind::Text, reply_ref);
                Ok((message, None))
            }
            Draft::Voice {
                room_id,
                sender_id,
                bytes,
                mime_type,
                duration_secs,
                reply_ref,
            } => {
                let kind = MessageKind::Voice(VoiceAttachment {
                    attachment: Attachment::staged(mime_type.clone(), bytes.len() as u64),
                    duration_secs,
                });
                let message = PendingMessage::new(room_id, sender_id, None, kind, reply_ref);
                Ok((message, Some(StagedBytes { bytes, mime_type })))
            }
            Draft::File {
                room_id,
                sender_id,
                bytes,
                mime_type,
                file_name,
                caption,
                reply_ref,
            } => {
                let kind = MessageKind::File(FileAttachment {
                    attachment: Attachment::staged(mime_type.clone(), bytes.len() as u64),
                    file_name,
                });
                let message = PendingMessage::new(room_id, sender_id, caption, kind, reply_ref);
                Ok((message, Some(StagedBytes { bytes, mime_type })))
            }
        }
    }
}

enum AttemptOutcome {
    Delivered(Option<String>),
    Failed(String),
    /// The message disappeared mid-attempt (cancelled or reaped).
    Discarded,
}

#[derive(Default)]
struct DeliveryState {
    /// Pending and failed messages known to this session.
    live: HashMap<String, PendingMessage>,
    /// Canonical ids of messages acknowledged this session, keyed by temporary id.
    delivered: HashMap<String, String>,
    /// Cancelled ids whose delivery task has not exited yet.
    tombstones: HashSet<String>,
    /// Temporary ids with a running delivery task.
    active: HashSet<String>,
    signals: HashMap<String, Arc<Notify>>,
}

impl DeliveryState {
    fn signal(&mut self, temporary_id: &str) -> Arc<Notify> {
        self.signals
            .entry(temporary_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake the delivery task, if any, and forget it.
    fn release(&mut self, temporary_id: &str) {
        if let Some(signal) = self.signals.remove(temporary_id) {
            signal.notify_one();
        }
        self.active.remove(temporary_id);
    }

    fn is_settled(&self, temporary_id: &str) -> bool {
        self.tombstones.contains(temporary_id) || self.delivered.contains_key(temporary_id)
    }

    /// Adopt stored records this session has not seen yet.
    fn absorb(&mut self, records: Vec<PendingMessage>) {
        for record in records {
            if self.is_settled(&record.temporary_id) {
                continue;
            }
            self.live.entry(record.temporary_id.clone()).or_insert(record);
        }
    }

    fn room(&self, room_id: &str) -> Vec<PendingMessage> {
        let mut records: Vec<PendingMessage> = self
            .live
            .values()
            .filter(|message| message.room_id == room_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.temporary_id.cmp(&b.temporary_id))
        });
        records
    }
}

/// Session-scoped service driving every outgoing message to a terminal state.
#[derive(Clone)]
pub struct DeliveryOrchestrator {
    queue: PendingQueueStore,
    blobs: BlobStore,
    transport: Arc<dyn Transport>,
    uploader: AttachmentUploader,
    connectivity: ConnectivityMonitor,
    policy: DeliveryPolicy,
    events: Arc<EventDispatcher>,
    state: Arc<Mutex<DeliveryState>>,
}

impl DeliveryOrchestrator {
    pub fn new(
        db: &ClientDatabase,
        transport: Arc<dyn Transport>,
        uploader: AttachmentUploader,
        connectivity: ConnectivityMonitor,
        policy: DeliveryPolicy,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            queue: PendingQueueStore::new(db),
            blobs: BlobStore::new(db),
            transport,
            uploader,
            connectivity,
            policy,
            events,
            state: Arc::new(Mutex::new(DeliveryState::default())),
        }
    }

    /// Wire up a full session from configuration: database, WebSocket
    /// transport, HTTP object storage, reachability check and listener.
    pub async fn connect(config: &ClientConfig) -> DeliveryResult<Self> {
        config.policy.validate()?;

        let db = ClientDatabase::new(&config.database_url).await?;
        db.run_migrations().await?;

        let connectivity = ConnectivityMonitor::new(false);
        let transport = WebSocketTransport::spawn(
            TransportCredentials {
                server_url: config.server_url.clone(),
                user_id: config.user_id.clone(),
                api_key: config.api_key.clone(),
                api_secret: config.api_secret.clone(),
            },
            connectivity.clone(),
        );
        let storage = HttpObjectStorage::new(&config.upload)?;
        let uploader = AttachmentUploader::new(Arc::new(storage), config.upload.max_attachment_bytes);

        let orchestrator = Self::new(
            &db,
            Arc::new(transport),
            uploader,
            connectivity.clone(),
            config.policy.clone(),
            Arc::new(EventDispatcher::new()),
        );

        if let Some(reachability_url) = &config.reachability_url {
            connectivity.spawn_reachability_check(
                reachability_url.clone(),
                Duration::from_millis(config.reachability_interval_ms),
            );
        }
        orchestrator.spawn_connectivity_listener();

        tracing::info!("CLIENT {}: Delivery orchestrator ready", config.user_id);
        Ok(orchestrator)
    }

    pub fn events(&self) -> Arc<EventDispatcher> {
        self.events.clone()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    pub async fn send_text(
        &self,
        room_id: &str,
        sender_id: &str,
        body: &str,
        reply_ref: Option<ReplyRef>,
    ) -> DeliveryResult<PendingMessage> {
        self.submit(Draft::Text {
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            reply_ref,
        })
        .await
    }

    pub async fn send_voice(
        &self,
        room_id: &str,
        sender_id: &str,
        bytes: Vec<u8>,
        mime_type: &str,
        duration_secs: f64,
        reply_ref: Option<ReplyRef>,
    ) -> DeliveryResult<PendingMessage> {
        self.submit(Draft::Voice {
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            bytes,
            mime_type: mime_type.to_string(),
            duration_secs,
            reply_ref,
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_file(
        &self,
        room_id: &str,
        sender_id: &str,
        bytes: Vec<u8>,
        mime_type: &str,
        file_name: &str,
        caption: Option<String>,
        reply_ref: Option<ReplyRef>,
    ) -> DeliveryResult<PendingMessage> {
        self.submit(Draft::File {
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            bytes,
            mime_type: mime_type.to_string(),
            file_name: file_name.to_string(),
            caption,
            reply_ref,
        })
        .await
    }

    /// Stage a draft as a `pending` message and start delivering it.
    ///
    /// Attachment bytes reach the blob store before the queue record exists,
    /// so a stored record that expects bytes always has them.
    pub async fn submit(&self, draft: Draft) -> DeliveryResult<PendingMessage> {
        let (message, staged) = draft.stage()?;
        let temporary_id = message.temporary_id.clone();

        if let Some(staged) = &staged {
            self.uploader
                .validate(staged.bytes.len() as u64, &staged.mime_type)
                .map_err(DeliveryError::AttachmentRejected)?;
            if let Err(e) = self.blobs.save(&temporary_id, &staged.bytes, &staged.mime_type).await {
                self.report_storage_error("stage attachment", &e);
                return Err(e.into());
            }
        }

        let mut state = self.state.lock().await;
        if let Err(e) = self.queue.upsert(&message).await {
            self.report_storage_error("queue message", &e);
            if staged.is_some() {
                if let Err(e) = self.blobs.delete(&temporary_id).await {
                    self.report_storage_error("discard staged attachment", &e);
                }
            }
            return Err(e.into());
        }
        state.live.insert(temporary_id.clone(), message.clone());

        tracing::info!(
            "DELIVERY {}: Queued in room {} (kind={})",
            temporary_id,
            message.room_id,
            kind_name(&message.kind)
        );
        self.events.emit_queued(&message);

        if !self.start(&temporary_id, &mut state) {
            tracing::info!("DELIVERY {}: Offline, holding until connectivity returns", temporary_id);
        }
        Ok(message)
    }

    /// Manually put a `failed` message back to `pending`.
    pub async fn retry(&self, temporary_id: &str) -> DeliveryResult<PendingMessage> {
        let mut state = self.state.lock().await;

        if state.tombstones.contains(temporary_id) {
            return Err(DeliveryError::Cancelled(temporary_id.to_string()));
        }
        if state.delivered.contains_key(temporary_id) {
            return Err(DeliveryError::InvalidTransition {
                temporary_id: temporary_id.to_string(),
                from: DeliveryStatus::Sent,
                to: DeliveryStatus::Pending,
            });
        }
        if !state.live.contains_key(temporary_id) {
            match self.find_stored(temporary_id).await? {
                Some(record) => state.absorb(vec![record]),
                None => return Err(DeliveryError::MessageNotFound(temporary_id.to_string())),
            }
        }

        let current = state
            .live
            .get(temporary_id)
            .cloned()
            .ok_or_else(|| DeliveryError::MessageNotFound(temporary_id.to_string()))?;

        if current.status != DeliveryStatus::Failed {
            return Err(DeliveryError::InvalidTransition {
                temporary_id: temporary_id.to_string(),
                from: current.status,
                to: DeliveryStatus::Pending,
            });
        }
        if current.awaiting_upload() && !self.blobs.contains(temporary_id).await? {
            tracing::warn!("DELIVERY {}: Retry refused, attachment bytes are gone", temporary_id);
            return Err(DeliveryError::RetryRefused {
                temporary_id: temporary_id.to_string(),
                reason: "attachment bytes are no longer available".into(),
            });
        }

        let mut updated = current;
        updated.transition_to(DeliveryStatus::Pending)?;
        updated.first_attempt_at = None;
        self.queue.upsert(&updated).await?;
        state.live.insert(temporary_id.to_string(), updated.clone());

        tracing::info!("DELIVERY {}: Manual retry", temporary_id);
        self.events.emit_retrying(temporary_id);
        self.start(temporary_id, &mut state);

        Ok(updated)
    }

    /// Remove a pending or failed message for good. Cancelling a message that
    /// is already gone is a no-op.
    pub async fn cancel(&self, temporary_id: &str) -> DeliveryResult<()> {
        let mut state = self.state.lock().await;

        if state.tombstones.contains(temporary_id) {
            return Ok(());
        }
        if state.delivered.contains_key(temporary_id) {
            return Err(DeliveryError::InvalidState(format!(
                "{} was already sent",
                temporary_id
            )));
        }

        let message = match state.live.get(temporary_id).cloned() {
            Some(message) => message,
            None => match self.find_stored(temporary_id).await? {
                Some(message) => message,
                None => {
                    tracing::debug!("DELIVERY {}: Nothing to cancel", temporary_id);
                    return Ok(());
                }
            },
        };

        // Stores first, so a storage failure leaves the message untouched and
        // the cancel can simply be repeated.
        self.queue.remove(&message.room_id, temporary_id).await?;
        if message.holds_blob() {
            self.blobs.delete(temporary_id).await?;
        }

        state.live.remove(temporary_id);
        // A running delivery task may still be inside an attempt.
        if state.active.contains(temporary_id) {
            state.tombstones.insert(temporary_id.to_string());
        }
        state.release(temporary_id);

        tracing::info!("DELIVERY {}: Cancelled", temporary_id);
        self.events.emit_cancelled(temporary_id, &message.room_id);
        Ok(())
    }

    /// Resume every stored `pending` message across all rooms.
    /// Returns how many delivery tasks were started.
    pub async fn flush_all(&self) -> DeliveryResult<usize> {
        let mut state = self.state.lock().await;
        let rooms = self.queue.list_all().await?;
        state.absorb(rooms.into_values().flatten().collect());

        let resumable: Vec<String> = state
            .live
            .values()
            .filter(|message| message.status == DeliveryStatus::Pending)
            .map(|message| message.temporary_id.clone())
            .collect();

        let mut started = 0;
        for temporary_id in resumable {
            if self.start(&temporary_id, &mut state) {
                started += 1;
            }
        }

        tracing::info!("DELIVERY: Flush started {} delivery tasks", started);
        Ok(started)
    }

    /// Merge server history with local records for a room, reap local copies
    /// the server already has and resume the room's pending messages.
    pub async fn enter_room(&self, room_id: &str, server_history: &[RoomMessage]) -> DeliveryResult<Vec<TimelineEntry>> {
        let outcome = {
            let mut state = self.state.lock().await;
            let stored = self.queue.list(room_id).await?;
            state.absorb(stored);
            merge_room_history(server_history, &state.room(room_id))
        };

        for record in &outcome.reaped {
            let canonical_id = server_history
                .iter()
                .find(|message| message.matches(&record.temporary_id) || message.id == record.canonical_id)
                .map(|message| message.id.clone());
            self.complete(&record.temporary_id, canonical_id, true).await;
        }

        let mut state = self.state.lock().await;
        for entry in &outcome.timeline {
            if let TimelineEntry::Local(message) = entry {
                if message.status == DeliveryStatus::Pending {
                    self.start(&message.temporary_id, &mut state);
                }
            }
        }

        tracing::debug!(
            "DELIVERY: Entered room {} ({} entries, {} reaped)",
            room_id,
            outcome.timeline.len(),
            outcome.reaped.len()
        );
        Ok(outcome.timeline)
    }

    /// Local pending and failed messages of a room, oldest first.
    pub async fn room_view(&self, room_id: &str) -> DeliveryResult<Vec<PendingMessage>> {
        let mut state = self.state.lock().await;
        let stored = self.queue.list(room_id).await?;
        state.absorb(stored);
        Ok(state.room(room_id))
    }

    /// Current record of a pending or failed message. Sent and cancelled
    /// messages are no longer tracked here.
    pub async fn message(&self, temporary_id: &str) -> Option<PendingMessage> {
        self.state.lock().await.live.get(temporary_id).cloned()
    }

    /// Server id adopted by a message sent during this session.
    pub async fn canonical_id(&self, temporary_id: &str) -> Option<String> {
        self.state.lock().await.delivered.get(temporary_id).cloned()
    }

    /// Flush the queue each time connectivity comes back.
    pub fn spawn_connectivity_listener(&self) -> JoinHandle<()> {
        let this = self.clone();
        let mut rx = self.connectivity.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                this.events.emit_connectivity_changed(online);
                if !online {
                    continue;
                }
                match this.flush_all().await {
                    Ok(started) => tracing::info!("DELIVERY: Back online, resumed {} messages", started),
                    Err(e) => tracing::error!("DELIVERY: Flush after reconnect failed: {}", e),
                }
            }
        })
    }

    /// Spawn the delivery task for a message unless one is running or the
    /// device is offline.
    fn start(&self, temporary_id: &str, state: &mut DeliveryState) -> bool {
        if !self.connectivity.is_online() {
            return false;
        }
        if !state.active.insert(temporary_id.to_string()) {
            return false;
        }

        let signal = state.signal(temporary_id);
        let this = self.clone();
        let temporary_id = temporary_id.to_string();
        tokio::spawn(async move {
            this.clone().drive(temporary_id.clone(), signal).await;
            this.retire(&temporary_id).await;
        });
        true
    }

    /// The delivery task has exited; nothing can report for this id anymore.
    async fn retire(&self, temporary_id: &str) {
        self.state.lock().await.tombstones.remove(temporary_id);
    }

    async fn drive(self, temporary_id: String, cancel: Arc<Notify>) {
        let Some(deadline) = self.open_window(&temporary_id).await else {
            return;
        };

        let mut delays = self.backoff();
        let mut attempt = 0u32;

        loop {
            let snapshot = {
                let state = self.state.lock().await;
                match state.live.get(&temporary_id) {
                    Some(message) if !state.tombstones.contains(&temporary_id) => message.clone(),
                    _ => return,
                }
            };

            if Instant::now() >= deadline {
                self.fail(&temporary_id, attempt).await;
                return;
            }

            if !self.connectivity.is_online() {
                tracing::debug!("DELIVERY {}: Offline, waiting", temporary_id);
                tokio::select! {
                    _ = self.connectivity.wait_for_online() => {}
                    _ = sleep_until(deadline) => {}
                    _ = cancel.notified() => {}
                }
                continue;
            }

            attempt += 1;
            tracing::debug!("DELIVERY {}: Attempt {}", temporary_id, attempt);

            let outcome = tokio::select! {
                outcome = self.attempt(&snapshot) => Some(outcome),
                _ = sleep_until(deadline) => None,
            };
            let Some(outcome) = outcome else {
                continue;
            };

            match outcome {
                AttemptOutcome::Delivered(canonical_id) => {
                    self.complete(&temporary_id, canonical_id, false).await;
                    return;
                }
                AttemptOutcome::Discarded => return,
                AttemptOutcome::Failed(reason) => {
                    if !self.record_failed_attempt(&temporary_id, attempt, &reason).await {
                        return;
                    }
                    let delay = delays.next().unwrap_or_else(|| self.policy.backoff_max());
                    let wake_at = (Instant::now() + delay).min(deadline);
                    tokio::select! {
                        _ = sleep_until(wake_at) => {}
                        _ = cancel.notified() => {}
                    }
                }
            }
        }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.policy.backoff_initial())
            .with_max_delay(self.policy.backoff_max())
            .with_factor(2.0)
            .without_max_times()
            .build()
    }

    /// Deadline of the current delivery window, stamping its start on first
    /// use. The window survives restarts; only a manual retry reopens it.
    /// `None` if the message is gone.
    async fn open_window(&self, temporary_id: &str) -> Option<Instant> {
        let mut state = self.state.lock().await;
        let Some(message) = state.live.get_mut(temporary_id) else {
            state.release(temporary_id);
            return None;
        };

        let now = Utc::now();
        let opened_at = match message.first_attempt_at {
            Some(opened_at) => opened_at,
            None => {
                message.first_attempt_at = Some(now);
                let snapshot = message.clone();
                self.persist(&snapshot).await;
                now
            }
        };

        // Clock skew can put `opened_at` in the future; count that as no time used.
        let used = (now - opened_at).to_std().unwrap_or_default();
        let remaining = self.policy.deadline().saturating_sub(used);
        if used > Duration::ZERO {
            tracing::debug!("DELIVERY {}: Resuming window with {:?} left", temporary_id, remaining);
        }
        Some(Instant::now() + remaining)
    }

    async fn attempt(&self, snapshot: &PendingMessage) -> AttemptOutcome {
        let temporary_id = &snapshot.temporary_id;
        let mut message = snapshot.clone();

        if message.awaiting_upload() {
            let url = match self.upload_attachment(&message).await {
                Ok(url) => url,
                Err(reason) => return AttemptOutcome::Failed(reason),
            };

            let mut state = self.state.lock().await;
            let Some(live) = state.live.get_mut(temporary_id) else {
                tracing::debug!("DELIVERY {}: Upload finished after removal, discarding", temporary_id);
                return AttemptOutcome::Discarded;
            };
            live.record_upload(url);
            message = live.clone();
            self.persist(&message).await;
        }

        let attempt_timeout = self.policy.attempt_timeout();
        match timeout(attempt_timeout, self.transport.send(OutboundMessage::from(&message))).await {
            Ok(Ok(ack)) if ack.success => AttemptOutcome::Delivered(ack.canonical_id),
            Ok(Ok(ack)) => AttemptOutcome::Failed(ack.error.unwrap_or_else(|| "rejected by server".into())),
            Ok(Err(e)) => AttemptOutcome::Failed(e.to_string()),
            Err(_) => AttemptOutcome::Failed(format!("no ack within {:?}", attempt_timeout)),
        }
    }

    async fn upload_attachment(&self, message: &PendingMessage) -> Result<String, String> {
        let temporary_id = message.temporary_id.clone();

        let blob = match self.blobs.get(&temporary_id).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return Err("attachment bytes missing from blob store".into()),
            Err(e) => {
                self.report_storage_error("load attachment", &e);
                return Err(e.to_string());
            }
        };

        self.set_upload_progress(&temporary_id, 0, false).await;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        let progress_id = temporary_id.clone();
        let upload_name = message.kind.upload_name(&temporary_id);
        let upload = self.uploader.upload(
            &blob.bytes,
            &blob.mime_type,
            &upload_name,
            move |progress| {
                events.emit_upload_progress(&progress_id, progress);
                let _ = progress_tx.send(progress);
            },
        );
        // Ends once the uploader drops its progress callback.
        let track = async {
            while let Some(progress) = progress_rx.recv().await {
                self.set_upload_progress(&temporary_id, progress, true).await;
            }
        };

        let (result, ()) = tokio::join!(upload, track);
        result
            .map(|uploaded| uploaded.url)
            .map_err(|e| format!("upload failed: {}", e))
    }

    /// Mirror upload progress into the live record.
    async fn set_upload_progress(&self, temporary_id: &str, progress: u8, monotonic: bool) {
        let mut state = self.state.lock().await;
        if let Some(message) = state.live.get_mut(temporary_id) {
            let current = message.upload_progress.unwrap_or(0);
            message.upload_progress = Some(if monotonic { current.max(progress) } else { progress });
        }
    }

    /// False if the message is gone and the task should stop.
    async fn record_failed_attempt(&self, temporary_id: &str, attempt: u32, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(message) = state.live.get_mut(temporary_id) else {
            return false;
        };
        message.retry_count += 1;
        let snapshot = message.clone();
        self.persist(&snapshot).await;

        tracing::warn!("DELIVERY {}: Attempt {} failed: {}", temporary_id, attempt, reason);
        self.events.emit_attempt_failed(temporary_id, attempt, reason);
        true
    }

    async fn fail(&self, temporary_id: &str, attempts: u32) {
        let mut state = self.state.lock().await;
        let Some(message) = state.live.get_mut(temporary_id) else {
            return;
        };
        if let Err(e) = message.transition_to(DeliveryStatus::Failed) {
            tracing::warn!("DELIVERY {}: {}", temporary_id, e);
            state.release(temporary_id);
            return;
        }
        let snapshot = message.clone();
        self.persist(&snapshot).await;
        state.release(temporary_id);

        tracing::error!(
            "DELIVERY {}: Failed, deadline of {:?} elapsed after {} attempts",
            temporary_id,
            self.policy.deadline(),
            attempts
        );
        self.events.emit_failed(&snapshot);
    }

    /// Promote a message to `sent`. Ignored for cancelled or already-sent ids.
    async fn complete(&self, temporary_id: &str, canonical_id: Option<String>, reaped: bool) {
        let mut state = self.state.lock().await;

        if state.tombstones.contains(temporary_id) {
            tracing::debug!("DELIVERY {}: Dropping ack for cancelled message", temporary_id);
            return;
        }
        if state.delivered.contains_key(temporary_id) {
            tracing::debug!("DELIVERY {}: Ignoring repeated ack", temporary_id);
            return;
        }
        let Some(mut message) = state.live.remove(temporary_id) else {
            return;
        };

        // A failed record found in server history goes back through pending.
        if message.status == DeliveryStatus::Failed {
            message.status = DeliveryStatus::Pending;
        }
        if let Err(e) = message.transition_to(DeliveryStatus::Sent) {
            tracing::warn!("DELIVERY {}: {}", temporary_id, e);
            state.live.insert(temporary_id.to_string(), message);
            return;
        }
        message.canonical_id = canonical_id.unwrap_or_else(|| temporary_id.to_string());

        if let Err(e) = self.queue.remove(&message.room_id, temporary_id).await {
            self.report_storage_error("remove sent message", &e);
        }
        if message.holds_blob() {
            if let Err(e) = self.blobs.delete(temporary_id).await {
                self.report_storage_error("delete sent attachment", &e);
            }
        }

        state.release(temporary_id);
        state
            .delivered
            .insert(temporary_id.to_string(), message.canonical_id.clone());

        if reaped {
            tracing::info!(
                "DELIVERY {}: Already in server history as {}, reaped",
                temporary_id,
                message.canonical_id
            );
            self.events.emit_reaped(temporary_id, &message.canonical_id);
        } else {
            tracing::info!("DELIVERY {}: Sent as {}", temporary_id, message.canonical_id);
            self.events.emit_sent(&message);
        }
    }

    async fn persist(&self, message: &PendingMessage) {
        if let Err(e) = self.queue.upsert(message).await {
            self.report_storage_error("persist message", &e);
        }
    }

    async fn find_stored(&self, temporary_id: &str) -> DeliveryResult<Option<PendingMessage>> {
        let rooms = self.queue.list_all().await?;
        Ok(rooms
            .into_values()
            .flatten()
            .find(|message| message.temporary_id == temporary_id))
    }

    fn report_storage_error(&self, operation: &str, err: &ClientError) {
        tracing::error!("DATABASE: {} failed: {}", operation, err);
        self.events.emit_storage_error(operation, &err.to_string());
    }
}

fn kind_name(kind: &MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Voice(_) => "voice",
        MessageKind::File(_) => "file",
    }
}
