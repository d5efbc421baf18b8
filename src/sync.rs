use fs2::FileExt;
use log::{debug, error, info, warn};
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::capture::CaptureRecord;
use crate::connectivity::Connectivity;
use crate::queue::SubmissionQueue;
use crate::store::DamagedCapture;
use crate::DynError;

/// Why an upload did not succeed. The engine only cares which of the two
/// kinds it is.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadError {
    /// No response obtained (network down, timeout, connection reset).
    /// The capture stays queued and is retried by a later drain.
    Connectivity(String),
    /// The remote answered and refused the payload. Retrying cannot help,
    /// so the capture is dropped.
    Rejected { status: Option<u16>, message: String },
    /// The capture could not be turned into a request on this device.
    /// Nothing was sent; retrying would fail the same way.
    Encoding(String),
}

impl UploadError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, UploadError::Connectivity(_))
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Connectivity(msg) => write!(f, "Connectivity failure: {}", msg),
            UploadError::Rejected {
                status: Some(status),
                message,
            } => write!(f, "Rejected with HTTP {}: {}", status, message),
            UploadError::Rejected {
                status: None,
                message,
            } => write!(f, "Rejected: {}", message),
            UploadError::Encoding(msg) => write!(f, "Local encoding failure: {}", msg),
        }
    }
}

impl std::error::Error for UploadError {}

/// How a drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every record in the snapshot was resolved
    Completed,
    /// Stopped early because the remote became unreachable
    Interrupted,
    /// Another drain was already running; nothing was attempted
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    /// Captures accepted by the remote and removed from the queue
    pub delivered: usize,
    /// Local ids dropped as non-retryable: refused by the remote, impossible
    /// to encode, or corrupted in local storage
    pub rejected: Vec<String>,
    /// Captures still queued when the drain ended
    pub remaining: usize,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            outcome: DrainOutcome::AlreadyRunning,
            delivered: 0,
            rejected: Vec::new(),
            remaining: 0,
        }
    }
}

/// Resolution of one record inside a drain
enum Step {
    Resolved,
    Stop,
}

/// Clears the single-flight flag and releases the lock file on every exit path
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
    lock_file: Option<File>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.lock_file.take() {
            let _ = FileExt::unlock(&file);
        }
        self.flag.store(false, Ordering::Release);
    }
}

/// Delivers queued captures in order, one drain at a time
pub struct SyncEngine {
    queue: Arc<SubmissionQueue>,
    connectivity: Arc<dyn Connectivity>,
    draining: AtomicBool,
    lock_path: Option<PathBuf>,
}

impl SyncEngine {
    pub fn new(queue: Arc<SubmissionQueue>, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            queue,
            connectivity,
            draining: AtomicBool::new(false),
            lock_path: None,
        }
    }

    /// Also hold an exclusive lock on `path` while draining, so separate
    /// processes sharing one data directory never drain concurrently
    pub fn with_lock_file(mut self, path: PathBuf) -> Self {
        self.lock_path = Some(path);
        self
    }

    pub fn queue(&self) -> &Arc<SubmissionQueue> {
        &self.queue
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Deliver every pending capture through `upload`, in insertion order.
    ///
    /// Returns immediately with [`DrainOutcome::AlreadyRunning`] if a drain is
    /// in progress. A capture is removed from the queue only after `upload`
    /// returned `Ok` or a rejection; a crash in between means a re-upload.
    pub async fn drain<F, Fut>(&self, mut upload: F) -> Result<DrainReport, DynError>
    where
        F: FnMut(CaptureRecord) -> Fut,
        Fut: Future<Output = Result<(), UploadError>>,
    {
        let _guard = match self.begin()? {
            Some(guard) => guard,
            None => return Ok(DrainReport::skipped()),
        };

        let snapshot = self.queue.scan().await?;
        let mut report = self.new_report();
        self.discard_damaged(snapshot.damaged, &mut report).await?;
        let pending = snapshot.records;
        info!("Draining {} pending capture(s)", pending.len());

        for record in pending {
            match self.deliver_one(record, &mut upload, &mut report).await? {
                Step::Resolved => {}
                Step::Stop => {
                    report.outcome = DrainOutcome::Interrupted;
                    break;
                }
            }
        }

        self.finish(report).await
    }

    /// Like [`drain`](Self::drain) but groups consecutive captures without
    /// photos into batches of up to `batch_size` sent through `upload_batch`.
    ///
    /// Captures with photos always travel alone through `upload`, so order
    /// is kept. A rejected batch is retried record by record through
    /// `upload` so only the offending capture is dropped.
    pub async fn drain_batched<F, Fut, B, BFut>(
        &self,
        batch_size: usize,
        mut upload: F,
        mut upload_batch: B,
    ) -> Result<DrainReport, DynError>
    where
        F: FnMut(CaptureRecord) -> Fut,
        Fut: Future<Output = Result<(), UploadError>>,
        B: FnMut(Vec<CaptureRecord>) -> BFut,
        BFut: Future<Output = Result<(), UploadError>>,
    {
        let _guard = match self.begin()? {
            Some(guard) => guard,
            None => return Ok(DrainReport::skipped()),
        };

        let snapshot = self.queue.scan().await?;
        let mut report = self.new_report();
        self.discard_damaged(snapshot.damaged, &mut report).await?;
        let pending = snapshot.records;
        info!(
            "Draining {} pending capture(s) (batch size {})",
            pending.len(),
            batch_size
        );

        let batch_size = batch_size.max(1);
        let mut iter = pending.into_iter().peekable();
        'outer: while let Some(record) = iter.next() {
            if record.has_attachments() || batch_size == 1 {
                if let Step::Stop = self.deliver_one(record, &mut upload, &mut report).await? {
                    report.outcome = DrainOutcome::Interrupted;
                    break;
                }
                continue;
            }

            let mut batch = vec![record];
            while batch.len() < batch_size {
                match iter.peek() {
                    Some(next) if !next.has_attachments() => {
                        if let Some(next) = iter.next() {
                            batch.push(next);
                        }
                    }
                    _ => break,
                }
            }

            if !self.connectivity.is_reachable() {
                debug!("Remote unreachable, stopping before batch");
                report.outcome = DrainOutcome::Interrupted;
                break;
            }

            let ids: Vec<String> = batch.iter().map(|r| r.local_id.clone()).collect();
            match upload_batch(batch.clone()).await {
                Ok(()) => {
                    for id in &ids {
                        self.queue.dequeue_success(id).await?;
                    }
                    report.delivered += ids.len();
                    info!("Delivered batch of {} capture(s)", ids.len());
                }
                Err(UploadError::Connectivity(msg)) => {
                    warn!("Batch upload interrupted: {}", msg);
                    report.outcome = DrainOutcome::Interrupted;
                    break;
                }
                Err(rejection) => {
                    warn!(
                        "Batch of {} rejected ({}), falling back to single uploads",
                        ids.len(),
                        rejection
                    );
                    for record in batch {
                        if let Step::Stop =
                            self.deliver_one(record, &mut upload, &mut report).await?
                        {
                            report.outcome = DrainOutcome::Interrupted;
                            break 'outer;
                        }
                    }
                }
            }
        }

        self.finish(report).await
    }

    /// Claim the single-flight flag (and lock file). None if already held.
    fn begin(&self) -> Result<Option<DrainGuard<'_>>, DynError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress, skipping");
            return Ok(None);
        }

        let mut guard = DrainGuard {
            flag: &self.draining,
            lock_file: None,
        };

        if let Some(path) = &self.lock_path {
            let file = File::create(path)
                .map_err(|e| format!("Failed to create lock file '{}': {}", path.display(), e))?;
            if file.try_lock_exclusive().is_err() {
                info!(
                    "Drain lock {} held by another process, skipping",
                    path.display()
                );
                return Ok(None);
            }
            guard.lock_file = Some(file);
        }

        Ok(Some(guard))
    }

    fn new_report(&self) -> DrainReport {
        DrainReport {
            outcome: DrainOutcome::Completed,
            delivered: 0,
            rejected: Vec::new(),
            remaining: 0,
        }
    }

    /// Corrupted captures can never be uploaded; drop them so the readable
    /// ones behind them still go out
    async fn discard_damaged(
        &self,
        damaged: Vec<DamagedCapture>,
        report: &mut DrainReport,
    ) -> Result<(), DynError> {
        for capture in damaged {
            error!(
                "Capture {} is corrupted in local storage, dropping it: {}",
                capture.local_id, capture.error
            );
            self.queue.dequeue_success(&capture.local_id).await?;
            report.rejected.push(capture.local_id);
        }
        Ok(())
    }

    async fn deliver_one<F, Fut>(
        &self,
        record: CaptureRecord,
        upload: &mut F,
        report: &mut DrainReport,
    ) -> Result<Step, DynError>
    where
        F: FnMut(CaptureRecord) -> Fut,
        Fut: Future<Output = Result<(), UploadError>>,
    {
        // Never skip ahead: a later capture must not overtake this one
        if !self.connectivity.is_reachable() {
            debug!("Remote unreachable, stopping before {}", record.local_id);
            return Ok(Step::Stop);
        }

        let local_id = record.local_id.clone();
        match upload(record).await {
            Ok(()) => {
                self.queue.dequeue_success(&local_id).await?;
                report.delivered += 1;
                info!("Delivered capture {}", local_id);
                Ok(Step::Resolved)
            }
            Err(UploadError::Connectivity(msg)) => {
                warn!("Upload of {} interrupted: {}", local_id, msg);
                Ok(Step::Stop)
            }
            Err(UploadError::Encoding(msg)) => {
                error!(
                    "Capture {} could not be encoded locally, dropping it: {}",
                    local_id, msg
                );
                self.queue.dequeue_success(&local_id).await?;
                report.rejected.push(local_id);
                Ok(Step::Resolved)
            }
            Err(rejection) => {
                warn!(
                    "Capture {} rejected by remote, dropping it: {}",
                    local_id, rejection
                );
                self.queue.dequeue_success(&local_id).await?;
                report.rejected.push(local_id);
                Ok(Step::Resolved)
            }
        }
    }

    async fn finish(&self, mut report: DrainReport) -> Result<DrainReport, DynError> {
        report.remaining = self.queue.pending_count().await?;
        info!(
            "Drain {:?}: {} delivered, {} rejected, {} remaining",
            report.outcome,
            report.delivered,
            report.rejected.len(),
            report.remaining
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PhotoSlot;
    use crate::connectivity::ConnectivityMonitor;
    use crate::store::LocalStore;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    async fn setup(reachable: bool) -> (SyncEngine, Arc<ConnectivityMonitor>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let queue = Arc::new(SubmissionQueue::new(store).await.unwrap());
        let monitor = Arc::new(ConnectivityMonitor::new(reachable));
        let engine = SyncEngine::new(queue, monitor.clone());
        (engine, monitor, dir)
    }

    async fn enqueue(engine: &SyncEngine, ids: &[&str]) {
        for id in ids {
            let mut r = CaptureRecord::new("LOC-9", NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
            r.local_id = id.to_string();
            engine.queue().enqueue(&r).await.unwrap();
        }
    }

    async fn pending_ids(engine: &SyncEngine) -> Vec<String> {
        engine
            .queue()
            .snapshot()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.local_id)
            .collect()
    }

    #[tokio::test]
    async fn test_drain_stops_at_connectivity_failure_and_resumes() {
        let (engine, _monitor, _dir) = setup(true).await;
        enqueue(&engine, &["r1", "r2", "r3"]).await;

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = attempts.clone();
        let report = engine
            .drain(move |record: CaptureRecord| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(record.local_id.clone());
                    if record.local_id == "r2" {
                        Err(UploadError::Connectivity("timeout".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(report.outcome, DrainOutcome::Interrupted);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.remaining, 2);
        // r3 must not overtake r2
        assert_eq!(*attempts.lock().unwrap(), vec!["r1", "r2"]);
        assert_eq!(pending_ids(&engine).await, vec!["r2", "r3"]);

        let report = engine
            .drain(|_record: CaptureRecord| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn test_rejected_capture_is_dropped() {
        let (engine, _monitor, _dir) = setup(true).await;
        enqueue(&engine, &["r1", "bad", "r3"]).await;

        let report = engine
            .drain(|record: CaptureRecord| async move {
                if record.local_id == "bad" {
                    Err(UploadError::Rejected {
                        status: Some(400),
                        message: "malformed".into(),
                    })
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.rejected, vec!["bad".to_string()]);
        assert!(pending_ids(&engine).await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_attempts_nothing() {
        let (engine, _monitor, _dir) = setup(false).await;
        enqueue(&engine, &["r1"]).await;

        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let report = engine
            .drain(move |_record: CaptureRecord| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.outcome, DrainOutcome::Interrupted);
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn test_second_drain_returns_already_running() {
        let (engine, _monitor, _dir) = setup(true).await;
        enqueue(&engine, &["r1", "r2"]).await;
        let engine = Arc::new(engine);

        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let (started_tx, mut started_rx) = tokio::sync::mpsc::channel::<()>(4);
        let uploads = Arc::new(Mutex::new(0));

        let first = {
            let engine = engine.clone();
            let uploads = uploads.clone();
            tokio::spawn(async move {
                engine
                    .drain(move |_record: CaptureRecord| {
                        let mut release = release_rx.clone();
                        let started = started_tx.clone();
                        let uploads = uploads.clone();
                        async move {
                            *uploads.lock().unwrap() += 1;
                            let _ = started.send(()).await;
                            while !*release.borrow_and_update() {
                                if release.changed().await.is_err() {
                                    break;
                                }
                            }
                            Ok(())
                        }
                    })
                    .await
                    .unwrap()
            })
        };

        started_rx.recv().await.unwrap();
        assert!(engine.is_draining());
        let second = engine
            .drain(|_record: CaptureRecord| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(second.outcome, DrainOutcome::AlreadyRunning);

        release_tx.send(true).unwrap();
        let report = first.await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(*uploads.lock().unwrap(), 2);
        assert!(!engine.is_draining());
    }

    #[tokio::test]
    async fn test_lock_file_held_elsewhere_skips_drain() {
        let (engine, _monitor, dir) = setup(true).await;
        enqueue(&engine, &["r1"]).await;
        let lock_path = dir.path().join("drain.lock");
        let engine = engine.with_lock_file(lock_path.clone());

        let other = File::create(&lock_path).unwrap();
        other.lock_exclusive().unwrap();
        let report = engine
            .drain(|_record: CaptureRecord| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(report.outcome, DrainOutcome::AlreadyRunning);
        assert!(!engine.is_draining());

        FileExt::unlock(&other).unwrap();
        let report = engine
            .drain(|_record: CaptureRecord| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(report.outcome, DrainOutcome::Completed);
    }

    #[tokio::test]
    async fn test_batched_drain_keeps_photo_records_single() {
        let (engine, _monitor, _dir) = setup(true).await;
        enqueue(&engine, &["a1", "a2"]).await;
        let mut with_photo =
            CaptureRecord::new("LOC-9", NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        with_photo.local_id = "p1".to_string();
        with_photo.set_photo(PhotoSlot::Overview, "image/jpeg", vec![1, 2, 3]);
        engine.queue().enqueue(&with_photo).await.unwrap();
        enqueue(&engine, &["a3"]).await;

        let log = Arc::new(Mutex::new(Vec::new()));
        let single_log = log.clone();
        let batch_log = log.clone();
        let report = engine
            .drain_batched(
                10,
                move |record: CaptureRecord| {
                    let log = single_log.clone();
                    async move {
                        log.lock().unwrap().push(format!("single:{}", record.local_id));
                        Ok(())
                    }
                },
                move |records: Vec<CaptureRecord>| {
                    let log = batch_log.clone();
                    async move {
                        let ids: Vec<String> = records.into_iter().map(|r| r.local_id).collect();
                        log.lock().unwrap().push(format!("batch:{}", ids.join(",")));
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.delivered, 4);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["batch:a1,a2", "single:p1", "batch:a3"]
        );
    }

    #[tokio::test]
    async fn test_rejected_batch_falls_back_to_single_uploads() {
        let (engine, _monitor, _dir) = setup(true).await;
        enqueue(&engine, &["a1", "bad", "a3"]).await;

        let report = engine
            .drain_batched(
                5,
                |record: CaptureRecord| async move {
                    if record.local_id == "bad" {
                        Err(UploadError::Rejected {
                            status: Some(400),
                            message: "invalid".into(),
                        })
                    } else {
                        Ok(())
                    }
                },
                |_records: Vec<CaptureRecord>| async {
                    Err(UploadError::Rejected {
                        status: Some(400),
                        message: "batch refused".into(),
                    })
                },
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.rejected, vec!["bad".to_string()]);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn test_corrupted_capture_is_dropped_and_rest_delivered() {
        let (engine, _monitor, _dir) = setup(true).await;
        let mut damaged =
            CaptureRecord::new("LOC-9", NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        damaged.local_id = "broken".to_string();
        damaged.set_photo(PhotoSlot::End, "image/jpeg", vec![7, 7, 7]);
        enqueue(&engine, &["r1"]).await;
        engine.queue().enqueue(&damaged).await.unwrap();
        enqueue(&engine, &["r3"]).await;

        sqlx::query("UPDATE pending_photos SET checksum = checksum + 1")
            .execute(engine.queue().store().pool())
            .await
            .unwrap();

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let seen = delivered.clone();
        let report = engine
            .drain(move |record: CaptureRecord| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(record.local_id);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.rejected, vec!["broken".to_string()]);
        assert_eq!(report.remaining, 0);
        assert_eq!(*delivered.lock().unwrap(), vec!["r1", "r3"]);
    }

    #[tokio::test]
    async fn test_batched_drain_drops_corrupted_capture() {
        let (engine, _monitor, _dir) = setup(true).await;
        enqueue(&engine, &["a1", "bad", "a3"]).await;
        sqlx::query("UPDATE pending_captures SET payload = 'not json' WHERE local_id = 'bad'")
            .execute(engine.queue().store().pool())
            .await
            .unwrap();

        let batches = Arc::new(Mutex::new(Vec::new()));
        let seen = batches.clone();
        let report = engine
            .drain_batched(
                5,
                |_record: CaptureRecord| async { Ok(()) },
                move |records: Vec<CaptureRecord>| {
                    let seen = seen.clone();
                    async move {
                        let ids: Vec<String> = records.into_iter().map(|r| r.local_id).collect();
                        seen.lock().unwrap().push(ids.join(","));
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(report.rejected, vec!["bad".to_string()]);
        assert_eq!(*batches.lock().unwrap(), vec!["a1,a3"]);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn test_encoding_failure_is_dropped_without_stopping() {
        let (engine, _monitor, _dir) = setup(true).await;
        enqueue(&engine, &["r1", "odd", "r3"]).await;

        let report = engine
            .drain(|record: CaptureRecord| async move {
                if record.local_id == "odd" {
                    Err(UploadError::Encoding("invalid content type".into()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.rejected, vec!["odd".to_string()]);
        assert!(pending_ids(&engine).await.is_empty());
    }

    #[test]
    fn test_upload_error_kinds() {
        assert!(UploadError::Connectivity("timeout".into()).is_connectivity());
        let rejected = UploadError::Rejected {
            status: Some(400),
            message: "bad date".into(),
        };
        assert!(!rejected.is_connectivity());
        assert_eq!(rejected.to_string(), "Rejected with HTTP 400: bad date");

        let encoding = UploadError::Encoding("bad mime".into());
        assert!(!encoding.is_connectivity());
        assert!(encoding.to_string().starts_with("Local encoding failure"));
    }
}
