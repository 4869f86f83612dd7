//! Connectivity monitors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{NetworkMonitor, TransportError};

/// Publish `connected` if it differs from the current state
fn publish(state: &watch::Sender<bool>, connected: bool) -> bool {
    state.send_if_modified(|current| {
        if *current == connected {
            false
        } else {
            *current = connected;
            true
        }
    })
}

/// Monitor whose state is set by the host application
pub struct ManualNetworkMonitor {
    state: watch::Sender<bool>,
}

impl ManualNetworkMonitor {
    pub fn new(connected: bool) -> Self {
        let (state, _) = watch::channel(connected);
        Self { state }
    }

    /// Set connectivity; subscribers are notified only on a change
    pub fn set_connected(&self, connected: bool) {
        if publish(&self.state, connected) {
            debug!(connected, "Connectivity changed");
        }
    }
}

#[async_trait]
impl NetworkMonitor for ManualNetworkMonitor {
    async fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

struct Probe {
    url: String,
    client: reqwest::Client,
    state: watch::Sender<bool>,
}

impl Probe {
    /// Any HTTP response counts as connected
    async fn check(&self) -> bool {
        let connected = self.client.head(&self.url).send().await.is_ok();
        if publish(&self.state, connected) {
            info!(connected, url = %self.url, "Connectivity changed");
        }
        connected
    }
}

/// Monitor that probes a URL over HTTP.
///
/// Starts disconnected. `is_connected` probes on demand; `spawn_polling`
/// adds a background task that probes on an interval and publishes
/// transitions to subscribers.
pub struct ProbeNetworkMonitor {
    probe: Arc<Probe>,
    poller: Option<JoinHandle<()>>,
}

impl ProbeNetworkMonitor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let (state, _) = watch::channel(false);

        Ok(Self {
            probe: Arc::new(Probe {
                url: url.into(),
                client,
                state,
            }),
            poller: None,
        })
    }

    /// Probe every `interval` until the monitor is dropped
    pub fn spawn_polling(&mut self, interval: Duration) {
        if let Some(previous) = self.poller.take() {
            previous.abort();
        }

        let probe = Arc::clone(&self.probe);
        self.poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                probe.check().await;
            }
        }));
    }
}

impl Drop for ProbeNetworkMonitor {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

#[async_trait]
impl NetworkMonitor for ProbeNetworkMonitor {
    async fn is_connected(&self) -> bool {
        self.probe.check().await
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.probe.state.subscribe()
    }
}
