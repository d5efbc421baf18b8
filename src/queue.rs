//! Submission queue: the only owner of the local store.

use log::info;
use tokio::sync::watch;

use crate::capture::CaptureRecord;
use crate::store::{DamagedCapture, LocalStore};
use crate::DynError;

/// Pending captures in insertion order, plus the ones that could not be read
#[derive(Debug, Default)]
pub struct QueueSnapshot {
    pub records: Vec<CaptureRecord>,
    pub damaged: Vec<DamagedCapture>,
}

pub struct SubmissionQueue {
    store: LocalStore,
    pending_tx: watch::Sender<usize>,
}

impl SubmissionQueue {
    pub async fn new(store: LocalStore) -> Result<Self, DynError> {
        let pending = store.count().await?;
        let (pending_tx, _) = watch::channel(pending);
        Ok(Self { store, pending_tx })
    }

    /// Persist a capture. An error here means the capture was NOT saved and
    /// the caller must tell the user.
    pub async fn enqueue(&self, record: &CaptureRecord) -> Result<(), DynError> {
        self.store.put(record).await?;
        info!("Queued capture {}", record.local_id);
        self.publish_count().await
    }

    /// Remove a capture after the remote side accepted (or permanently
    /// rejected) it. Calling it again for the same id is a no-op.
    pub async fn dequeue_success(&self, local_id: &str) -> Result<bool, DynError> {
        let removed = self.store.delete(local_id).await?;
        if removed {
            self.publish_count().await?;
        }
        Ok(removed)
    }

    /// Readable pending captures in stable insertion order
    pub async fn snapshot(&self) -> Result<Vec<CaptureRecord>, DynError> {
        Ok(self.scan().await?.records)
    }

    /// Like `snapshot`, but also returns the captures whose stored form is
    /// corrupted. Both lists are in insertion order.
    pub async fn scan(&self) -> Result<QueueSnapshot, DynError> {
        let mut scan = self.store.list_all().await?;
        scan.captures.sort_by_key(|s| s.seq);
        scan.damaged.sort_by_key(|d| d.seq);
        Ok(QueueSnapshot {
            records: scan.captures.into_iter().map(|s| s.record).collect(),
            damaged: scan.damaged,
        })
    }

    pub async fn pending_count(&self) -> Result<usize, DynError> {
        self.store.count().await
    }

    /// Receiver notified whenever the pending count changes
    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    /// Drop every pending capture (sign-out)
    pub async fn clear(&self) -> Result<(), DynError> {
        self.store.clear().await?;
        info!("Cleared pending captures");
        self.publish_count().await
    }

    pub fn device_id(&self) -> &str {
        self.store.device_id()
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &LocalStore {
        &self.store
    }

    async fn publish_count(&self) -> Result<(), DynError> {
        let count = self.store.count().await?;
        self.pending_tx.send_replace(count);
        Ok(())
    }
}
