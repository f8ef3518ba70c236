use crate::connectivity::ConnectivityMonitor;
use crate::errors::ClientError;
use crate::ClientResult;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use courier_core::protocol::{ClientFrame, OutboundMessage, SendAck, ServerFrame};
use courier_core::{DeliveryError, DeliveryResult};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type HmacSha256 = Hmac<Sha256>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type AckWaiters = Arc<Mutex<HashMap<String, oneshot::Sender<SendAck>>>>;

// Heartbeat while a session is up
const PING_INTERVAL: Duration = Duration::from_secs(10);
// Pause between a dropped session and the next connect
const RECONNECTION_INTERVAL: Duration = Duration::from_secs(1);

/// Real-time channel used for each send attempt.
///
/// One call is one attempt. Implementations do not retry; a returned error or
/// a rejected ack is a failed attempt and the orchestrator schedules the next.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> DeliveryResult<SendAck>;
}

#[derive(Debug, Clone)]
pub struct TransportCredentials {
    pub server_url: String,
    pub user_id: String,
    pub api_key: String,
    pub api_secret: String,
}

/// Removes the ack waiter when an attempt finishes or is abandoned.
struct AckGuard {
    temporary_id: String,
    waiters: AckWaiters,
}

impl Drop for AckGuard {
    fn drop(&mut self) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.remove(&self.temporary_id);
        }
    }
}

/// WebSocket transport with a supervised connection.
///
/// A background task keeps the socket up, reconnecting with exponential
/// backoff, authenticates each session with an HMAC-signed frame and routes
/// `MessageAck` frames back to the attempt waiting on that temporary id.
pub struct WebSocketTransport {
    outbound: mpsc::Sender<ClientFrame>,
    waiters: AckWaiters,
    is_connected: Arc<AtomicBool>,
    supervisor: JoinHandle<()>,
}

impl WebSocketTransport {
    pub fn spawn(credentials: TransportCredentials, monitor: ConnectivityMonitor) -> Self {
        let (tx, rx) = mpsc::channel::<ClientFrame>(100);
        let waiters: AckWaiters = Arc::new(Mutex::new(HashMap::new()));
        let is_connected = Arc::new(AtomicBool::new(false));

        let supervisor = tokio::spawn(Self::supervise(
            credentials,
            monitor,
            rx,
            waiters.clone(),
            is_connected.clone(),
        ));

        Self {
            outbound: tx,
            waiters,
            is_connected,
            supervisor,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.supervisor.abort();
    }

    async fn supervise(
        credentials: TransportCredentials,
        monitor: ConnectivityMonitor,
        mut outbound: mpsc::Receiver<ClientFrame>,
        waiters: AckWaiters,
        is_connected: Arc<AtomicBool>,
    ) {
        let user_id = credentials.user_id.clone();
        tracing::info!("CLIENT {}: Transport supervisor started", user_id);

        loop {
            let ws_stream = Self::connect_with_retry(&credentials.server_url, &monitor).await;

            let keep_running = match Self::run_session(
                ws_stream,
                &credentials,
                &monitor,
                &mut outbound,
                &waiters,
                &is_connected,
            )
            .await
            {
                Ok(keep_running) => keep_running,
                Err(e) => {
                    tracing::warn!("CLIENT {}: Session ended with error: {}", user_id, e);
                    true
                }
            };

            is_connected.store(false, Ordering::Relaxed);
            monitor.report(false);
            // Dropping the senders fails every in-flight attempt right away.
            if let Ok(mut pending) = waiters.lock() {
                pending.clear();
            }

            if !keep_running {
                tracing::info!("CLIENT {}: Transport dropped, supervisor exiting", user_id);
                return;
            }
            tokio::time::sleep(RECONNECTION_INTERVAL).await;
        }
    }

    async fn connect_with_retry(server_url: &str, monitor: &ConnectivityMonitor) -> WsStream {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter()
            .without_max_times();

        let connect = || async { connect_async(server_url).await.map(|(ws, _)| ws) };

        let result = connect
            .retry(backoff)
            .notify(|err, delay| {
                monitor.report(false);
                tracing::debug!(
                    "Connection to {} failed: {} - retrying in {:?}",
                    server_url,
                    err,
                    delay
                );
            })
            .await;

        match result {
            Ok(ws) => ws,
            // Unreachable with an unbounded retry budget, but stay in the loop.
            Err(e) => {
                tracing::error!("Giving up connecting to {}: {}", server_url, e);
                std::future::pending().await
            }
        }
    }

    /// Runs one connected session. `Ok(false)` means the transport was dropped.
    async fn run_session(
        ws_stream: WsStream,
        credentials: &TransportCredentials,
        monitor: &ConnectivityMonitor,
        outbound: &mut mpsc::Receiver<ClientFrame>,
        waiters: &AckWaiters,
        is_connected: &Arc<AtomicBool>,
    ) -> ClientResult<bool> {
        let (mut write, mut read) = ws_stream.split();

        let timestamp = chrono::Utc::now().timestamp();
        let signature = create_hmac_signature(
            &credentials.api_secret,
            timestamp,
            &credentials.user_id,
            &credentials.api_key,
            "",
        )?;
        let auth = ClientFrame::Authenticate {
            user_id: credentials.user_id.clone(),
            api_key: credentials.api_key.clone(),
            signature,
            timestamp,
        };
        write.send(Message::Text(serde_json::to_string(&auth)?)).await?;

        let mut heartbeat = tokio::time::interval(PING_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        let _ = write.close().await;
                        return Ok(false);
                    };
                    write.send(Message::Text(serde_json::to_string(&frame)?)).await?;
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerFrame>(&text) {
                                Ok(frame) => {
                                    Self::handle_frame(frame, credentials, monitor, waiters, is_connected)?;
                                }
                                Err(e) => tracing::warn!("CLIENT {}: Unparseable frame: {}", credentials.user_id, e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("CLIENT {}: Server closed the connection", credentials.user_id);
                            return Ok(true);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                _ = heartbeat.tick() => {
                    if is_connected.load(Ordering::Relaxed) {
                        write.send(Message::Text(serde_json::to_string(&ClientFrame::Ping)?)).await?;
                    }
                }
            }
        }
    }

    fn handle_frame(
        frame: ServerFrame,
        credentials: &TransportCredentials,
        monitor: &ConnectivityMonitor,
        waiters: &AckWaiters,
        is_connected: &Arc<AtomicBool>,
    ) -> ClientResult<()> {
        match frame {
            ServerFrame::AuthSuccess { session_id } => {
                tracing::info!("CLIENT {}: Authenticated, session {}", credentials.user_id, session_id);
                is_connected.store(true, Ordering::Relaxed);
                monitor.report(true);
            }
            ServerFrame::AuthError { reason } => {
                tracing::error!("CLIENT {}: Authentication failed: {}", credentials.user_id, reason);
                return Err(ClientError::WebSocket(format!("authentication failed: {}", reason)));
            }
            ServerFrame::MessageAck { temporary_id, ack } => {
                let waiter = waiters
                    .lock()
                    .map_err(|_| ClientError::LockError("ack waiters".into()))?
                    .remove(&temporary_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => tracing::debug!(
                        "CLIENT {}: Dropping late ack for {}",
                        credentials.user_id,
                        temporary_id
                    ),
                }
            }
            ServerFrame::Error { code, message } => {
                tracing::warn!("CLIENT {}: Server error {:?}: {}", credentials.user_id, code, message);
            }
            ServerFrame::Pong => {}
        }
        Ok(())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: OutboundMessage) -> DeliveryResult<SendAck> {
        if !self.is_connected() {
            return Err(DeliveryError::Transport("not connected".into()));
        }

        let temporary_id = message.temporary_id.clone();
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .map_err(|_| DeliveryError::InvalidState("ack waiters lock poisoned".into()))?
            .insert(temporary_id.clone(), tx);
        let _guard = AckGuard {
            temporary_id,
            waiters: self.waiters.clone(),
        };

        self.outbound
            .send(ClientFrame::NewMessage { message })
            .await
            .map_err(|_| DeliveryError::Transport("transport is shut down".into()))?;

        rx.await
            .map_err(|_| DeliveryError::Transport("connection lost before ack".into()))
    }
}

pub(crate) fn create_hmac_signature(
    secret: &str,
    timestamp: i64,
    user_id: &str,
    api_key: &str,
    body: &str,
) -> ClientResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ClientError::WebSocket(format!("invalid HMAC key: {}", e)))?;

    let message = format!("{}.{}.{}.{}", timestamp, user_id, api_key, body);
    mac.update(message.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_signature_is_deterministic() {
        let a = create_hmac_signature("secret", 1_700_000_000, "user-1", "key", "").unwrap();
        let b = create_hmac_signature("secret", 1_700_000_000, "user-1", "key", "").unwrap();
        let c = create_hmac_signature("secret", 1_700_000_001, "user-1", "key", "").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_fast() {
        let monitor = ConnectivityMonitor::new(false);
        let transport = WebSocketTransport::spawn(
            TransportCredentials {
                server_url: "ws://127.0.0.1:9".into(),
                user_id: "user-1".into(),
                api_key: "key".into(),
                api_secret: "secret".into(),
            },
            monitor,
        );

        let message = courier_core::PendingMessage::new(
            "room-1",
            "user-1",
            Some("hi".into()),
            courier_core::MessageKind::Text,
            None,
        );
        let result = transport.send(OutboundMessage::from(&message)).await;

        assert!(matches!(result, Err(DeliveryError::Transport(_))));
        transport.shutdown();
    }
}
