use clap::ValueEnum;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    /// Field device holding the submission queue
    Client,
    /// Central ingest server
    Ingest,
}

fn default_api_port() -> u16 {
    3000
}

fn default_max_body_mb() -> usize {
    32
}

/// Upper bound for `max_body_mb`
pub const MAX_BODY_MB: usize = 1024;

const BYTES_PER_MB: usize = 1024 * 1024;

fn default_probe_interval_secs() -> u64 {
    15
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_pre_update_timeout_secs() -> u64 {
    10
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_batch_size() -> usize {
    1
}

fn default_max_dimension() -> u32 {
    1600
}

fn default_jpeg_quality() -> u8 {
    80
}

/// Field device configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Configuration type (must be "client")
    pub config_type: ConfigType,
    /// Base URL of the ingest server (e.g., http://central:3000)
    pub remote_url: String,
    /// Directory holding the local capture store and drain lock
    pub data_dir: PathBuf,
    /// Sync tuning (maps to [sync] section in TOML)
    #[serde(default)]
    pub sync: SyncSettings,
    /// Photo re-encoding before upload; photos are sent as-is when absent
    pub photos: Option<PhotoSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Seconds between health probes (default: 15)
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Per-request timeout (default: 30)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Upper bound on the drain run before an update (default: 10)
    #[serde(default = "default_pre_update_timeout_secs")]
    pub pre_update_timeout_secs: u64,
    /// First retry delay after an interrupted drain (default: 500)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Retry delay cap (default: 60000)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Photo-less captures sent per request; 1 disables batching (default: 1)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            pre_update_timeout_secs: default_pre_update_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            batch_size: default_batch_size(),
        }
    }
}

/// Maps to [photos] section in TOML
#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSettings {
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// Ingest server configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Configuration type (must be "ingest")
    pub config_type: ConfigType,
    /// SQLite file of the central store
    pub database_path: PathBuf,
    /// API server port (default: 3000)
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Request body limit in MiB (default: 32)
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.config_type != ConfigType::Client {
            return Err(format!(
                "config_type must be \"client\", found {:?}",
                self.config_type
            ));
        }

        let url = url::Url::parse(&self.remote_url)
            .map_err(|e| format!("Invalid remote_url '{}': {}", self.remote_url, e))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(format!(
                "remote_url must use http or https, found '{}'",
                url.scheme()
            ));
        }

        if self.sync.request_timeout_secs == 0 {
            return Err("sync.request_timeout_secs must be greater than 0".to_string());
        }
        if self.sync.probe_interval_secs == 0 {
            return Err("sync.probe_interval_secs must be greater than 0".to_string());
        }
        if self.sync.batch_size == 0 {
            return Err("sync.batch_size must be at least 1".to_string());
        }
        if self.sync.backoff_base_ms > self.sync.backoff_max_ms {
            return Err("sync.backoff_base_ms must not exceed sync.backoff_max_ms".to_string());
        }

        if let Some(photos) = &self.photos {
            if photos.max_dimension == 0 {
                return Err("photos.max_dimension must be greater than 0".to_string());
            }
            if !(1..=100).contains(&photos.jpeg_quality) {
                return Err(format!(
                    "photos.jpeg_quality must be between 1 and 100, found {}",
                    photos.jpeg_quality
                ));
            }
        }

        Ok(())
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.config_type != ConfigType::Ingest {
            return Err(format!(
                "config_type must be \"ingest\", found {:?}",
                self.config_type
            ));
        }
        if self.max_body_mb == 0 {
            return Err("max_body_mb must be greater than 0".to_string());
        }
        if self.max_body_mb > MAX_BODY_MB || self.max_body_mb.checked_mul(BYTES_PER_MB).is_none() {
            return Err(format!(
                "max_body_mb must be at most {}, found {}",
                MAX_BODY_MB, self.max_body_mb
            ));
        }
        Ok(())
    }

    /// Request body limit in bytes
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_mb.saturating_mul(BYTES_PER_MB)
    }
}

fn read_config_file(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))
}

pub fn load_client_config(path: &Path) -> Result<ClientConfig, String> {
    let content = read_config_file(path)?;
    let config: ClientConfig = toml::from_str(&content)
        .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
    config.validate()?;
    Ok(config)
}

pub fn load_ingest_config(path: &Path) -> Result<IngestConfig, String> {
    let content = read_config_file(path)?;
    let config: IngestConfig = toml::from_str(&content)
        .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
    config.validate()?;
    Ok(config)
}
