use clap::{Parser, Subcommand};
use field_capture_sync::capture::{CaptureRecord, PhotoSlot};
use field_capture_sync::client::{IngestClient, PhotoEncoding};
use field_capture_sync::config::{load_client_config, load_ingest_config, ClientConfig};
use field_capture_sync::connectivity::{probe_once, spawn_health_probe, ConnectivityMonitor};
use field_capture_sync::constants::{generate_local_id, DRAIN_LOCK_FILE};
use field_capture_sync::queue::SubmissionQueue;
use field_capture_sync::service::SyncService;
use field_capture_sync::store::LocalStore;
use field_capture_sync::sync::{DrainReport, SyncEngine};
use field_capture_sync::update::{PreUpdateDrain, UpdateCoordinator};
use field_capture_sync::{ingest, DynError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Offline-first submission queue for field captures")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the central ingest server
    Ingest {
        /// Path to config file (TOML format, config_type = "ingest")
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Queue a capture read from a JSON file
    Enqueue {
        /// Path to config file (TOML format, config_type = "client")
        #[arg(short, long)]
        config: PathBuf,

        /// Capture record as JSON
        capture: PathBuf,

        /// Photo to attach, as slot=path (overview, start, in_progress, end)
        #[arg(long = "photo")]
        photos: Vec<String>,
    },
    /// List captures waiting to be delivered
    Pending {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Deliver pending captures once, if the remote is reachable
    Sync {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Keep running, delivering captures whenever the remote is reachable
    Watch {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Discard every pending capture
    SignOut {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Flush the queue (bounded by pre_update_timeout_secs), then run the installer
    Update {
        #[arg(short, long)]
        config: PathBuf,

        /// Shell command performing the version swap
        #[arg(long)]
        swap_command: String,
    },
}

fn main() -> Result<(), DynError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let rt = tokio::runtime::Runtime::new()?;
    match args.command {
        Command::Ingest { config } => {
            let config = load_ingest_config(&config)?;
            rt.block_on(ingest::serve(config))
        }
        Command::Enqueue {
            config,
            capture,
            photos,
        } => {
            let config = load_client_config(&config)?;
            rt.block_on(enqueue(&config, &capture, &photos))
        }
        Command::Pending { config } => {
            let config = load_client_config(&config)?;
            rt.block_on(pending(&config))
        }
        Command::Sync { config } => {
            let config = load_client_config(&config)?;
            rt.block_on(sync_once(&config))
        }
        Command::Watch { config } => {
            let config = load_client_config(&config)?;
            rt.block_on(watch(config))
        }
        Command::SignOut { config } => {
            let config = load_client_config(&config)?;
            rt.block_on(async {
                let queue = open_queue(&config).await?;
                let count = queue.pending_count().await?;
                queue.clear().await?;
                println!("Discarded {} pending capture(s)", count);
                Ok::<(), DynError>(())
            })
        }
        Command::Update {
            config,
            swap_command,
        } => {
            let config = load_client_config(&config)?;
            rt.block_on(update(&config, &swap_command))
        }
    }
}

async fn open_queue(config: &ClientConfig) -> Result<Arc<SubmissionQueue>, DynError> {
    let store = LocalStore::open(&config.data_dir).await?;
    Ok(Arc::new(SubmissionQueue::new(store).await?))
}

fn build_client(config: &ClientConfig) -> Result<IngestClient, DynError> {
    let mut client = IngestClient::new(
        &config.remote_url,
        Duration::from_secs(config.sync.request_timeout_secs),
    )?;
    if let Some(photos) = &config.photos {
        client = client.with_photo_encoding(PhotoEncoding {
            max_dimension: photos.max_dimension,
            jpeg_quality: photos.jpeg_quality,
        });
    }
    Ok(client)
}

/// Queue, engine (holding the drain lock file), client and monitor
async fn build_sync(
    config: &ClientConfig,
) -> Result<(Arc<SyncEngine>, IngestClient, Arc<ConnectivityMonitor>), DynError> {
    let queue = open_queue(config).await?;
    let monitor = Arc::new(ConnectivityMonitor::new(false));
    let engine = SyncEngine::new(queue, monitor.clone())
        .with_lock_file(config.data_dir.join(DRAIN_LOCK_FILE));
    Ok((Arc::new(engine), build_client(config)?, monitor))
}

/// Probe the health endpoint once and record the result
async fn probe(client: &IngestClient, monitor: &ConnectivityMonitor, config: &ClientConfig) -> bool {
    let http = match reqwest::Client::builder()
        .timeout(Duration::from_secs(config.sync.request_timeout_secs))
        .build()
    {
        Ok(http) => http,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {}", e);
            return false;
        }
    };
    let reachable = probe_once(&http, &client.health_url()).await;
    monitor.set_reachable(reachable);
    reachable
}

fn print_report(report: &DrainReport) {
    println!(
        "{:?}: {} delivered, {} rejected, {} still pending",
        report.outcome,
        report.delivered,
        report.rejected.len(),
        report.remaining
    );
    for local_id in &report.rejected {
        println!("  rejected: {}", local_id);
    }
}

async fn enqueue(config: &ClientConfig, capture: &Path, photos: &[String]) -> Result<(), DynError> {
    let content = std::fs::read_to_string(capture)
        .map_err(|e| format!("Failed to read capture file '{}': {}", capture.display(), e))?;
    let mut value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse capture file '{}': {}", capture.display(), e))?;

    // fill in what the capture form would have stamped
    if let Some(obj) = value.as_object_mut() {
        obj.entry("local_id")
            .or_insert_with(|| serde_json::Value::String(generate_local_id()));
        obj.entry("local_created_at")
            .or_insert_with(|| serde_json::Value::String(chrono::Utc::now().to_rfc3339()));
    }
    let mut record: CaptureRecord = serde_json::from_value(value)
        .map_err(|e| format!("Invalid capture in '{}': {}", capture.display(), e))?;

    for photo_arg in photos {
        let (slot, path) = photo_arg
            .split_once('=')
            .ok_or_else(|| format!("Invalid --photo '{}', expected slot=path", photo_arg))?;
        let slot: PhotoSlot = slot.parse()?;
        let path = Path::new(path);
        let data = std::fs::read(path)
            .map_err(|e| format!("Failed to read photo '{}': {}", path.display(), e))?;
        let content_type = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("png") => "image/png",
            _ => "image/jpeg",
        };
        record.set_photo(slot, content_type, data);
    }

    if let Err(e) = record.validate() {
        eprintln!("Warning: {} (the server will reject this capture)", e);
    }

    let queue = open_queue(config).await?;
    queue.enqueue(&record).await?;
    println!(
        "Queued capture {} ({} pending)",
        record.local_id,
        queue.pending_count().await?
    );
    Ok(())
}

async fn pending(config: &ClientConfig) -> Result<(), DynError> {
    let queue = open_queue(config).await?;
    let scan = queue.scan().await?;
    println!(
        "{} pending capture(s) on device {}",
        scan.records.len() + scan.damaged.len(),
        queue.device_id()
    );
    for damaged in &scan.damaged {
        println!("  {}  CORRUPTED: {}", damaged.local_id, damaged.error);
    }
    for record in scan.records {
        println!(
            "  {}  {}  {}  photos: {}  crew: {}  equipment: {}",
            record.local_id,
            record.location_code,
            record.performed_on,
            record.photos.len(),
            record.transmittable_crew().len(),
            record.transmittable_equipment().len()
        );
    }
    Ok(())
}

async fn sync_once(config: &ClientConfig) -> Result<(), DynError> {
    let (engine, client, monitor) = build_sync(config).await?;
    if !probe(&client, &monitor, config).await {
        println!(
            "Remote {} unreachable, {} capture(s) kept for later",
            config.remote_url,
            engine.queue().pending_count().await?
        );
        return Ok(());
    }

    let service = SyncService::new(engine, client, monitor, config.sync.clone());
    let report = service.drain_once().await?;
    print_report(&report);
    Ok(())
}

async fn watch(config: ClientConfig) -> Result<(), DynError> {
    let (engine, client, monitor) = build_sync(&config).await?;
    let probe_handle = spawn_health_probe(
        monitor.clone(),
        client.health_url(),
        Duration::from_secs(config.sync.probe_interval_secs),
        Duration::from_secs(config.sync.request_timeout_secs),
    )?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Shutting down...");
            let _ = shutdown_tx.send(true);
        }
    });

    println!(
        "Watching {} (probe every {}s, Ctrl-C to stop)",
        config.remote_url, config.sync.probe_interval_secs
    );
    let service = SyncService::new(engine, client, monitor, config.sync.clone())
        .with_poll_interval(Duration::from_secs(config.sync.probe_interval_secs));
    let result = service.run(shutdown_rx).await;
    probe_handle.abort();
    result
}

async fn update(config: &ClientConfig, swap_command: &str) -> Result<(), DynError> {
    let (engine, client, monitor) = build_sync(config).await?;
    probe(&client, &monitor, config).await;

    let coordinator =
        UpdateCoordinator::new(Duration::from_secs(config.sync.pre_update_timeout_secs));
    let upload = |record: CaptureRecord| {
        let client = client.clone();
        async move { client.submit(&record).await.map(|_| ()) }
    };
    let swap = || async {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(swap_command)
            .status()
            .await
    };

    let (report, status) = coordinator.apply(&engine, upload, swap).await;
    match &report.pre_update {
        PreUpdateDrain::Drained(drain) => print_report(drain),
        PreUpdateDrain::TimedOut => println!("Pre-update drain timed out"),
        PreUpdateDrain::Failed(e) => println!("Pre-update drain failed: {}", e),
    }

    let status = status.map_err(|e| format!("Failed to run swap command: {}", e))?;
    if !status.success() {
        return Err(format!("Swap command exited with {}", status).into());
    }
    println!("Update applied");
    Ok(())
}
