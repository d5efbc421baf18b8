//! Best-effort flush of the queue before an application update.

use log::{info, warn};
use std::future::Future;
use std::time::Duration;

use crate::capture::CaptureRecord;
use crate::sync::{DrainOutcome, DrainReport, SyncEngine, UploadError};

/// What happened to the queue before the swap
#[derive(Debug, Clone, PartialEq)]
pub enum PreUpdateDrain {
    Drained(DrainReport),
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    pub pre_update: PreUpdateDrain,
}

pub struct UpdateCoordinator {
    timeout: Duration,
}

impl UpdateCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Drain once, bounded by the timeout, then run `swap` no matter how
    /// the drain ended. Captures left behind stay in the durable queue.
    pub async fn apply<F, Fut, S, SFut, T>(
        &self,
        engine: &SyncEngine,
        upload: F,
        swap: S,
    ) -> (UpdateReport, T)
    where
        F: FnMut(CaptureRecord) -> Fut,
        Fut: Future<Output = Result<(), UploadError>>,
        S: FnOnce() -> SFut,
        SFut: Future<Output = T>,
    {
        let pre_update = match tokio::time::timeout(self.timeout, engine.drain(upload)).await {
            Ok(Ok(report)) => {
                if report.outcome == DrainOutcome::AlreadyRunning {
                    info!("Drain already in progress before update, not waiting for it");
                } else if report.remaining > 0 {
                    warn!(
                        "Updating with {} capture(s) still queued",
                        report.remaining
                    );
                } else {
                    info!("Queue flushed before update");
                }
                PreUpdateDrain::Drained(report)
            }
            Ok(Err(e)) => {
                warn!("Pre-update drain failed, updating anyway: {}", e);
                PreUpdateDrain::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    "Pre-update drain exceeded {}s, updating anyway",
                    self.timeout.as_secs_f64()
                );
                PreUpdateDrain::TimedOut
            }
        };

        let swapped = swap().await;
        (UpdateReport { pre_update }, swapped)
    }
}
