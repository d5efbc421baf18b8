use chrono::{NaiveDate, NaiveTime};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use field_capture_sync::capture::{CaptureRecord, Coordinates, CrewEntry, EquipmentUsage, PhotoSlot};
use field_capture_sync::client::IngestClient;
use field_capture_sync::config::SyncSettings;
use field_capture_sync::connectivity::ConnectivityMonitor;
use field_capture_sync::ingest;
use field_capture_sync::queue::SubmissionQueue;
use field_capture_sync::service::SyncService;
use field_capture_sync::store::LocalStore;
use field_capture_sync::sync::{DrainOutcome, SyncEngine, UploadError};

struct TestServer {
    url: String,
    pool: SqlitePool,
    _dir: tempfile::TempDir,
    _handle: tokio::task::JoinHandle<()>,
}

/// Start the real ingest router over a fresh central store
async fn start_ingest_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let pool = ingest::open_central_store(&dir.path().join("central.sqlite"))
        .await
        .unwrap();
    let app = ingest::router(pool.clone(), 32 * 1024 * 1024);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{}", addr);

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestServer {
        url,
        pool,
        _dir: dir,
        _handle: handle,
    }
}

/// URL on which nothing listens
async fn closed_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

struct Device {
    queue: Arc<SubmissionQueue>,
    monitor: Arc<ConnectivityMonitor>,
    dir: tempfile::TempDir,
}

async fn new_device(reachable: bool) -> Device {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::open(dir.path()).await.unwrap();
    Device {
        queue: Arc::new(SubmissionQueue::new(store).await.unwrap()),
        monitor: Arc::new(ConnectivityMonitor::new(reachable)),
        dir,
    }
}

fn service_for(device: &Device, url: &str, batch_size: usize) -> SyncService {
    let engine = Arc::new(SyncEngine::new(device.queue.clone(), device.monitor.clone()));
    let client = IngestClient::new(url, Duration::from_secs(5)).unwrap();
    let settings = SyncSettings {
        batch_size,
        backoff_base_ms: 50,
        backoff_max_ms: 200,
        ..SyncSettings::default()
    };
    SyncService::new(engine, client, device.monitor.clone(), settings)
}

fn capture(location: &str) -> CaptureRecord {
    let mut record = CaptureRecord::new(location, NaiveDate::from_ymd_opt(2024, 10, 3).unwrap());
    record.site_name = Some("Riverside depot".to_string());
    record.started_at = NaiveTime::from_hms_opt(7, 30, 0);
    record.finished_at = NaiveTime::from_hms_opt(12, 0, 0);
    record.units_completed = 4;
    record
}

async fn intervention_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM interventions")
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn intervention_id(pool: &SqlitePool, local_id: &str) -> i64 {
    sqlx::query_scalar("SELECT id FROM interventions WHERE local_id = ?")
        .bind(local_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn fetch_intervention(url: &str, id: i64) -> Value {
    reqwest::get(format!("{}/api/interventions/{}", url, id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_end_to_end_delivery_with_photos_and_children() {
    let server = start_ingest_server().await;
    let device = new_device(true).await;

    let mut record = capture("LOC-100");
    record.geo.at_submission = Some(Coordinates::new(-33.45, -70.66));
    record.set_photo(PhotoSlot::Overview, "image/jpeg", vec![0xFF, 0xD8, 0x10]);
    record.set_photo(PhotoSlot::End, "image/jpeg", vec![0xFF, 0xD8, 0x20]);
    record.crew = vec![
        CrewEntry {
            crew_type: "skilled".into(),
            count: 2,
            hours: 8.0,
        },
        CrewEntry {
            crew_type: "helper".into(),
            count: 0,
            hours: 0.0,
        },
    ];
    record.equipment = vec![
        EquipmentUsage {
            item: "X".into(),
            hours: 0.0,
        },
        EquipmentUsage {
            item: "Y".into(),
            hours: 3.0,
        },
    ];
    device.queue.enqueue(&record).await.unwrap();

    let service = service_for(&device, &server.url, 1);
    let report = service.drain_once().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Completed);
    assert_eq!(report.delivered, 1);
    assert_eq!(device.queue.pending_count().await.unwrap(), 0);

    let id = intervention_id(&server.pool, &record.local_id).await;
    let stored = fetch_intervention(&server.url, id).await;
    assert_eq!(stored["location_code"], "LOC-100");
    assert_eq!(stored["site_name"], "Riverside depot");
    assert_eq!(stored["started_at"], "07:30:00");
    assert_eq!(stored["submitted_lat"], -33.45);
    assert_eq!(stored["photo_slots"], serde_json::json!(["end", "overview"]));
    assert_eq!(stored["crew"].as_array().unwrap().len(), 1);
    let equipment = stored["equipment"].as_array().unwrap();
    assert_eq!(equipment.len(), 1);
    assert_eq!(equipment[0]["item"], "Y");
}

#[tokio::test]
async fn test_resubmission_returns_existing_intervention() {
    let server = start_ingest_server().await;
    let client = IngestClient::new(&server.url, Duration::from_secs(5)).unwrap();
    let record = capture("LOC-200");

    let first = client.submit(&record).await.unwrap();
    assert!(first.created);
    let second = client.submit(&record).await.unwrap();
    assert!(!second.created);
    assert_eq!(first.id, second.id);
    assert_eq!(intervention_count(&server.pool).await, 1);
}

#[tokio::test]
async fn test_invalid_capture_is_rejected_and_dropped() {
    let server = start_ingest_server().await;
    let device = new_device(true).await;

    let mut bad = capture("LOC-300");
    bad.geo.corrected = Some(Coordinates::new(95.0, 0.0));
    let good = capture("LOC-301");
    device.queue.enqueue(&bad).await.unwrap();
    device.queue.enqueue(&good).await.unwrap();

    let client = IngestClient::new(&server.url, Duration::from_secs(5)).unwrap();
    match client.submit(&bad).await {
        Err(UploadError::Rejected { status, .. }) => assert_eq!(status, Some(400)),
        other => panic!("expected rejection, got {:?}", other),
    }

    let report = service_for(&device, &server.url, 1)
        .drain_once()
        .await
        .unwrap();
    assert_eq!(report.outcome, DrainOutcome::Completed);
    assert_eq!(report.rejected, vec![bad.local_id.clone()]);
    assert_eq!(report.delivered, 1);
    assert_eq!(device.queue.pending_count().await.unwrap(), 0);
    assert_eq!(intervention_count(&server.pool).await, 1);
}

#[tokio::test]
async fn test_unreachable_server_keeps_queue() {
    let url = closed_url().await;
    let device = new_device(true).await;
    device.queue.enqueue(&capture("LOC-400")).await.unwrap();
    device.queue.enqueue(&capture("LOC-401")).await.unwrap();

    let report = service_for(&device, &url, 1).drain_once().await.unwrap();
    assert_eq!(report.outcome, DrainOutcome::Interrupted);
    assert_eq!(report.delivered, 0);
    assert_eq!(report.remaining, 2);
}

#[tokio::test]
async fn test_batch_path_delivers_photo_less_records() {
    let server = start_ingest_server().await;
    let device = new_device(true).await;

    for loc in ["LOC-501", "LOC-502", "LOC-503"] {
        device.queue.enqueue(&capture(loc)).await.unwrap();
    }
    let mut with_photo = capture("LOC-504");
    with_photo.set_photo(PhotoSlot::Start, "image/jpeg", vec![0xFF, 0xD8, 0x30]);
    device.queue.enqueue(&with_photo).await.unwrap();
    let mut invalid = capture("LOC-505");
    invalid.crew = vec![CrewEntry {
        crew_type: "".into(),
        count: 1,
        hours: 1.0,
    }];
    device.queue.enqueue(&invalid).await.unwrap();

    let report = service_for(&device, &server.url, 10)
        .drain_once()
        .await
        .unwrap();
    assert_eq!(report.outcome, DrainOutcome::Completed);
    assert_eq!(report.remaining, 0);
    // the invalid batched record is skipped by the server
    assert_eq!(intervention_count(&server.pool).await, 4);

    let id = intervention_id(&server.pool, &with_photo.local_id).await;
    let stored = fetch_intervention(&server.url, id).await;
    assert_eq!(stored["photo_slots"], serde_json::json!(["start"]));
}

#[tokio::test]
async fn test_child_write_failure_keeps_primary_and_can_be_repaired() {
    let server = start_ingest_server().await;
    sqlx::query("DROP TABLE equipment_usage")
        .execute(&server.pool)
        .await
        .unwrap();

    let mut record = capture("LOC-600");
    record.crew = vec![CrewEntry {
        crew_type: "skilled".into(),
        count: 1,
        hours: 2.0,
    }];
    record.equipment = vec![EquipmentUsage {
        item: "truck-7".into(),
        hours: 1.5,
    }];

    let client = IngestClient::new(&server.url, Duration::from_secs(5)).unwrap();
    let receipt = client.submit(&record).await.unwrap();
    assert!(receipt.created);
    // follow-up also failed because the table is still gone
    assert!(!receipt.children_complete);
    assert_eq!(intervention_count(&server.pool).await, 1);

    field_capture_sync::db::init_central_store_schema(&server.pool)
        .await
        .unwrap();
    let http = reqwest::Client::new();
    let body = serde_json::json!({
        "crew": [{"crew_type": "skilled", "count": 1, "hours": 2.0}],
        "equipment": [{"item": "truck-7", "hours": 1.5}],
    });
    for _ in 0..2 {
        let response = http
            .post(format!(
                "{}/api/interventions/{}/children",
                server.url, receipt.id
            ))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let stored = fetch_intervention(&server.url, receipt.id).await;
    // crew was already stored and the repeat call inserted nothing twice
    assert_eq!(stored["crew"].as_array().unwrap().len(), 1);
    assert_eq!(stored["equipment"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_children_for_unknown_intervention_is_404() {
    let server = start_ingest_server().await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/interventions/999/children", server.url))
        .json(&serde_json::json!({"crew": [], "equipment": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_ingest_server().await;
    let response = reqwest::get(format!("{}/health", server.url)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_service_drains_when_connectivity_returns() {
    let server = start_ingest_server().await;
    let device = new_device(false).await;
    device.queue.enqueue(&capture("LOC-700")).await.unwrap();
    device.queue.enqueue(&capture("LOC-701")).await.unwrap();

    let service = Arc::new(service_for(&device, &server.url, 1));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run(shutdown_rx).await.map_err(|e| e.to_string()) })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(device.queue.pending_count().await.unwrap(), 2);

    let mut pending_rx = device.queue.subscribe_pending();
    device.monitor.set_reachable(true);
    tokio::time::timeout(Duration::from_secs(5), async {
        while *pending_rx.borrow_and_update() > 0 {
            pending_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("queue was not drained after reconnect");

    assert_eq!(intervention_count(&server.pool).await, 2);

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_service_delivers_capture_enqueued_while_online() {
    let server = start_ingest_server().await;
    let device = new_device(true).await;

    let service = Arc::new(service_for(&device, &server.url, 1));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run(shutdown_rx).await.map_err(|e| e.to_string()) })
    };

    // let the startup drain of the empty queue finish first
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut pending_rx = device.queue.subscribe_pending();
    device.queue.enqueue(&capture("LOC-800")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *pending_rx.borrow_and_update() > 0 {
            pending_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("capture queued while online was not delivered");

    assert_eq!(intervention_count(&server.pool).await, 1);

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_service_picks_up_captures_queued_by_another_process() {
    let server = start_ingest_server().await;
    let device = new_device(true).await;

    let service = Arc::new(
        service_for(&device, &server.url, 1).with_poll_interval(Duration::from_millis(100)),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run(shutdown_rx).await.map_err(|e| e.to_string()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // a second handle on the same data directory, like the CLI's `enqueue`
    let other = SubmissionQueue::new(LocalStore::open(device.dir.path()).await.unwrap())
        .await
        .unwrap();
    other.enqueue(&capture("LOC-810")).await.unwrap();
    other.enqueue(&capture("LOC-811")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while device.queue.pending_count().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("captures queued elsewhere were not delivered");

    assert_eq!(intervention_count(&server.pool).await, 2);

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
}
