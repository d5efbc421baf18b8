//! Long-running trigger loop: drains on startup, on every transition to
//! reachable, whenever a capture is queued while reachable, on an optional
//! poll tick, and after interrupted drains with capped backoff.

use log::{debug, error, info};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::capture::CaptureRecord;
use crate::client::IngestClient;
use crate::config::SyncSettings;
use crate::connectivity::Connectivity;
use crate::sync::{DrainOutcome, DrainReport, SyncEngine};
use crate::DynError;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
/// capped at `max`, then jittered down by up to a quarter.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let raw = base.saturating_mul(1u32 << exponent).min(max);
    let raw_ms = raw.as_millis() as u64;
    if raw_ms < 4 {
        return raw;
    }
    let jitter = rand::thread_rng().gen_range(0..=raw_ms / 4);
    Duration::from_millis(raw_ms - jitter)
}

pub struct SyncService {
    engine: Arc<SyncEngine>,
    client: IngestClient,
    connectivity: Arc<dyn Connectivity>,
    settings: SyncSettings,
    poll_interval: Option<Duration>,
}

impl SyncService {
    pub fn new(
        engine: Arc<SyncEngine>,
        client: IngestClient,
        connectivity: Arc<dyn Connectivity>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            engine,
            client,
            connectivity,
            settings,
            poll_interval: None,
        }
    }

    /// Also look at the store every `period`. Captures queued by another
    /// process never reach this process's pending notifications.
    pub fn with_poll_interval(mut self, period: Duration) -> Self {
        self.poll_interval = Some(period).filter(|p| !p.is_zero());
        self
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// One drain through the client, batched when `batch_size > 1`
    pub async fn drain_once(&self) -> Result<DrainReport, DynError> {
        let single = |record: CaptureRecord| {
            let client = self.client.clone();
            async move { client.submit(&record).await.map(|_| ()) }
        };

        if self.settings.batch_size > 1 {
            let batch = |records: Vec<CaptureRecord>| {
                let client = self.client.clone();
                async move { client.submit_batch(&records).await.map(|_| ()) }
            };
            self.engine
                .drain_batched(self.settings.batch_size, single, batch)
                .await
        } else {
            self.engine.drain(single).await
        }
    }

    /// Run until `shutdown` carries `true` (or its sender is dropped)
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DynError> {
        let mut reachable_rx = self.connectivity.subscribe();
        let mut was_reachable = *reachable_rx.borrow_and_update();
        let mut pending_rx = self.engine.queue().subscribe_pending();
        let mut poll = self.poll_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut attempt: u32 = 0;
        let mut retry_at: Option<Instant> = None;

        if *shutdown.borrow() {
            return Ok(());
        }

        if was_reachable {
            info!("Remote reachable at startup, draining");
            retry_at = self.drain_and_schedule(&mut attempt).await;
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Sync service stopping");
                        break;
                    }
                }
                changed = reachable_rx.changed() => {
                    if changed.is_err() {
                        info!("Connectivity source closed, sync service stopping");
                        break;
                    }
                    let reachable = *reachable_rx.borrow_and_update();
                    if reachable && !was_reachable {
                        attempt = 0;
                        retry_at = self.drain_and_schedule(&mut attempt).await;
                    } else if !reachable {
                        // wait for the next reachable transition instead
                        retry_at = None;
                    }
                    was_reachable = reachable;
                }
                changed = pending_rx.changed() => {
                    if changed.is_err() {
                        info!("Queue closed, sync service stopping");
                        break;
                    }
                    let pending = *pending_rx.borrow_and_update();
                    // backoff owns the schedule while a retry is due
                    if pending > 0
                        && retry_at.is_none()
                        && self.connectivity.is_reachable()
                        && !self.engine.is_draining()
                    {
                        debug!("{} capture(s) pending while reachable, draining", pending);
                        retry_at = self.drain_and_schedule(&mut attempt).await;
                    }
                }
                _ = tick(&mut poll) => {
                    if retry_at.is_none() && self.connectivity.is_reachable() {
                        match self.engine.queue().pending_count().await {
                            Ok(0) => {}
                            Ok(pending) => {
                                debug!("Poll found {} pending capture(s), draining", pending);
                                retry_at = self.drain_and_schedule(&mut attempt).await;
                            }
                            Err(e) => error!("Failed to count pending captures: {}", e),
                        }
                    }
                }
                _ = wait_until(retry_at) => {
                    retry_at = None;
                    if self.connectivity.is_reachable() {
                        debug!("Retrying drain (attempt {})", attempt);
                        retry_at = self.drain_and_schedule(&mut attempt).await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Drain once, returning when to retry (None when no retry is due)
    async fn drain_and_schedule(&self, attempt: &mut u32) -> Option<Instant> {
        let needs_retry = match self.drain_once().await {
            Ok(report) => match report.outcome {
                DrainOutcome::Completed => {
                    *attempt = 0;
                    false
                }
                DrainOutcome::AlreadyRunning => false,
                DrainOutcome::Interrupted => self.connectivity.is_reachable(),
            },
            Err(e) => {
                error!("Drain failed: {}", e);
                true
            }
        };

        if !needs_retry {
            return None;
        }

        *attempt = attempt.saturating_add(1);
        let delay = backoff_delay(
            *attempt,
            Duration::from_millis(self.settings.backoff_base_ms),
            Duration::from_millis(self.settings.backoff_max_ms),
        );
        info!("Retrying drain in {}ms", delay.as_millis());
        Some(Instant::now() + delay)
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(400);
        let max = Duration::from_millis(5000);

        let first = backoff_delay(1, base, max);
        assert!(first <= base && first >= Duration::from_millis(300));

        let third = backoff_delay(3, base, max);
        assert!(third <= Duration::from_millis(1600) && third >= Duration::from_millis(1200));

        for attempt in [10, 50, u32::MAX] {
            let capped = backoff_delay(attempt, base, max);
            assert!(capped <= max && capped >= Duration::from_millis(3750));
        }
    }

    #[test]
    fn test_backoff_zero_base() {
        assert_eq!(
            backoff_delay(3, Duration::ZERO, Duration::from_secs(1)),
            Duration::ZERO
        );
    }
}
