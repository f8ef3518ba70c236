use async_trait::async_trait;
use courier_client::events::{DeliveryEvent, EventDispatcher, EventType};
use courier_client::uploader::{ObjectStorage, ProgressSink, UploadObject};
use courier_client::{
    AttachmentUploader, BlobStore, ClientDatabase, ConnectivityMonitor, DeliveryOrchestrator, DeliveryPolicy,
    PendingQueueStore, Transport,
};
use courier_core::protocol::{OutboundMessage, SendAck};
use courier_core::{DeliveryError, DeliveryResult, DeliveryStatus, PendingMessage, UploadError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Delivery timings scaled down so tests run on the real clock.
#[allow(dead_code)]
pub fn fast_policy() -> DeliveryPolicy {
    DeliveryPolicy {
        deadline_ms: 600,
        attempt_timeout_ms: 100,
        backoff_initial_ms: 20,
        backoff_max_ms: 160,
    }
}

/// What the scripted transport does for one attempt.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Step {
    Fail,
    Reject,
    /// Never answers; the attempt timeout has to fire.
    Silent,
    Accept(Option<String>),
    AcceptAfter(Duration, String),
}

#[allow(dead_code)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    seen: Mutex<Vec<OutboundMessage>>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new(steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting(canonical_id: &str) -> Self {
        Self::new(Vec::new(), Step::Accept(Some(canonical_id.to_string())))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<OutboundMessage> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, message: OutboundMessage) -> DeliveryResult<SendAck> {
        self.seen.lock().unwrap().push(message);
        self.calls.fetch_add(1, Ordering::SeqCst);

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Fail => Err(DeliveryError::Transport("scripted failure".into())),
            Step::Reject => Ok(SendAck::rejected("scripted rejection")),
            Step::Silent => std::future::pending().await,
            Step::Accept(canonical_id) => Ok(SendAck {
                success: true,
                canonical_id,
                error: None,
            }),
            Step::AcceptAfter(delay, canonical_id) => {
                sleep(delay).await;
                Ok(SendAck::accepted(canonical_id))
            }
        }
    }
}

pub struct ScriptedStorage {
    failures_left: AtomicUsize,
    always_fail: AtomicBool,
    calls: AtomicUsize,
    uploaded: Mutex<Vec<Vec<u8>>>,
}

#[allow(dead_code)]
impl ScriptedStorage {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            always_fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            uploaded: Mutex::new(Vec::new()),
        }
    }

    pub fn reliable() -> Self {
        Self::failing_first(0)
    }

    pub fn broken() -> Self {
        let storage = Self::reliable();
        storage.always_fail.store(true, Ordering::SeqCst);
        storage
    }

    pub fn repair(&self) {
        self.always_fail.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Bytes of every successful upload, in order.
    pub fn uploaded(&self) -> Vec<Vec<u8>> {
        self.uploaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStorage for ScriptedStorage {
    async fn put(&self, object: UploadObject, progress: ProgressSink) -> Result<String, UploadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let total = object.bytes.len() as u64;
        progress(total / 2, total);

        let scripted_failure = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if self.always_fail.load(Ordering::SeqCst) || scripted_failure {
            return Err(UploadError::Network("scripted upload failure".into()));
        }

        progress(total, total);
        self.uploaded.lock().unwrap().push(object.bytes);
        Ok(format!("https://cdn.test/{}", object.key))
    }
}

#[allow(dead_code)]
pub struct Harness {
    pub db: ClientDatabase,
    pub orchestrator: DeliveryOrchestrator,
    pub transport: Arc<ScriptedTransport>,
    pub storage: Arc<ScriptedStorage>,
    pub monitor: ConnectivityMonitor,
    pub queue: PendingQueueStore,
    pub blobs: BlobStore,
    pub events: Arc<EventDispatcher>,
}

#[allow(dead_code)]
pub async fn harness(transport: ScriptedTransport, storage: ScriptedStorage, online: bool) -> Harness {
    harness_with_policy(transport, storage, online, fast_policy()).await
}

#[allow(dead_code)]
pub async fn harness_with_policy(
    transport: ScriptedTransport,
    storage: ScriptedStorage,
    online: bool,
    policy: DeliveryPolicy,
) -> Harness {
    let db = ClientDatabase::in_memory().await.unwrap();
    let transport = Arc::new(transport);
    let storage = Arc::new(storage);
    let monitor = ConnectivityMonitor::new(online);
    let events = Arc::new(EventDispatcher::new());

    let orchestrator = DeliveryOrchestrator::new(
        &db,
        transport.clone(),
        AttachmentUploader::new(storage.clone(), courier_client::config::DEFAULT_MAX_ATTACHMENT_BYTES),
        monitor.clone(),
        policy,
        events.clone(),
    );

    Harness {
        queue: PendingQueueStore::new(&db),
        blobs: BlobStore::new(&db),
        db,
        orchestrator,
        transport,
        storage,
        monitor,
        events,
    }
}

/// Polls until a pending or failed message reaches `status`, panicking after
/// a few seconds.
#[allow(dead_code)]
pub async fn wait_for_status(
    orchestrator: &DeliveryOrchestrator,
    temporary_id: &str,
    status: DeliveryStatus,
) -> PendingMessage {
    let limit = Instant::now() + WAIT_LIMIT;
    loop {
        if let Some(message) = orchestrator.message(temporary_id).await {
            if message.status == status {
                return message;
            }
        }
        assert!(
            Instant::now() < limit,
            "timed out waiting for {} to become {}",
            temporary_id,
            status
        );
        sleep(POLL_INTERVAL).await;
    }
}

#[allow(dead_code)]
pub async fn wait_for_calls(transport: &ScriptedTransport, calls: usize) {
    let limit = Instant::now() + WAIT_LIMIT;
    while transport.calls() < calls {
        assert!(Instant::now() < limit, "timed out waiting for {} transport calls", calls);
        sleep(POLL_INTERVAL).await;
    }
}

/// Collects every event; call [`drain_events`] from the same thread.
#[allow(dead_code)]
pub fn record_events(events: &EventDispatcher) -> Arc<Mutex<Vec<DeliveryEvent>>> {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    events
        .register_callback(move |event| sink.lock().unwrap().push(event))
        .unwrap();
    recorded
}

#[allow(dead_code)]
pub fn drain_events(events: &EventDispatcher, recorded: &Arc<Mutex<Vec<DeliveryEvent>>>) -> Vec<DeliveryEvent> {
    events.process_events().unwrap();
    recorded.lock().unwrap().clone()
}

#[allow(dead_code)]
pub fn count(events: &[DeliveryEvent], event_type: EventType) -> usize {
    events.iter().filter(|event| event.event_type() == event_type).count()
}

/// Polls until the message is acknowledged and returns its canonical id.
#[allow(dead_code)]
pub async fn wait_for_sent(orchestrator: &DeliveryOrchestrator, temporary_id: &str) -> String {
    let limit = Instant::now() + WAIT_LIMIT;
    loop {
        if let Some(canonical_id) = orchestrator.canonical_id(temporary_id).await {
            return canonical_id;
        }
        assert!(Instant::now() < limit, "timed out waiting for {} to be sent", temporary_id);
        sleep(POLL_INTERVAL).await;
    }
}
