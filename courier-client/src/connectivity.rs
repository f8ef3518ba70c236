use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Observable online/offline state.
///
/// Backed by a `watch` channel so every subscriber sees the latest value and
/// only transitions wake them. Clones share the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_online(&self) {
        self.report(true);
    }

    pub fn set_offline(&self) {
        self.report(false);
    }

    /// Record an observation. Returns true when it changed the state.
    pub fn report(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!("CONNECTIVITY: now {}", if online { "online" } else { "offline" });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub async fn wait_for_online(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as self, so this cannot fail.
        let _ = rx.wait_for(|online| *online).await;
    }

    /// Poll `url` every `interval` and report whether it answered.
    pub fn spawn_reachability_check(&self, url: String, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let http = match reqwest::Client::builder()
                .timeout(interval.min(Duration::from_secs(5)))
                .build()
            {
                Ok(http) => http,
                Err(e) => {
                    tracing::error!("CONNECTIVITY: reachability client could not be built: {}", e);
                    return;
                }
            };

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = match http.head(&url).send().await {
                    Ok(response) => !response.status().is_server_error(),
                    Err(e) => {
                        tracing::debug!("CONNECTIVITY: reachability check of {} failed: {}", url, e);
                        false
                    }
                };
                monitor.report(reachable);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
