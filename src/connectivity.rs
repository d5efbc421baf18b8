//! Reachability of the remote ingest endpoint.
//!
//! The engine never reads a process-wide flag; it is handed something that
//! implements [`Connectivity`]. [`ConnectivityMonitor`] is the stock
//! implementation, fed either by the host platform or by the health probe.

use log::{debug, info};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub trait Connectivity: Send + Sync {
    fn is_reachable(&self) -> bool;

    /// Receiver carrying the current reachability state
    fn subscribe(&self) -> watch::Receiver<bool>;
}

pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_reachable: bool) -> Self {
        let (state, _) = watch::channel(initially_reachable);
        Self { state }
    }

    /// Record an observation. Subscribers only wake on an actual transition.
    pub fn set_reachable(&self, reachable: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
        if changed {
            if reachable {
                info!("Remote became reachable");
            } else {
                info!("Remote became unreachable");
            }
        }
    }

    /// Run `callback` on every transition to reachable, until the monitor is dropped
    pub fn on_became_reachable<F, Fut>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.state.subscribe();
        tokio::spawn(async move {
            let mut was_reachable = *rx.borrow_and_update();
            while rx.changed().await.is_ok() {
                let reachable = *rx.borrow_and_update();
                if reachable && !was_reachable {
                    callback().await;
                }
                was_reachable = reachable;
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_reachable(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// Fallback poller for hosts without native connectivity events.
///
/// GETs `health_url` every `interval`; any 2xx marks the monitor reachable,
/// anything else (including transport errors) unreachable.
pub fn spawn_health_probe(
    monitor: Arc<ConnectivityMonitor>,
    health_url: String,
    interval: Duration,
    timeout: Duration,
) -> Result<JoinHandle<()>, reqwest::Error> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reachable = probe_once(&client, &health_url).await;
            monitor.set_reachable(reachable);
        }
    }))
}

/// Single health check
pub async fn probe_once(client: &reqwest::Client, health_url: &str) -> bool {
    match client.get(health_url).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!("Health probe to {} failed: {}", health_url, e);
            false
        }
    }
}
