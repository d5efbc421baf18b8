//! Durable local store for Capture Records.
//!
//! A SQLite table keyed by `local_id`, surviving restarts. The store makes no
//! ordering promise of its own; each row carries the monotonic `seq` assigned
//! on first insert so the queue can sort.

use log::debug;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::capture::{CaptureRecord, PhotoAttachment, PhotoSlot};
use crate::constants::LOCAL_STORE_FILE;
use crate::queries::captures;
use crate::DynError;

/// Errors detected while reading stored rows
#[derive(Debug)]
pub enum StoreError {
    /// Photo bytes no longer match the checksum written with them
    ChecksumMismatch {
        local_id: String,
        slot: String,
        expected: u32,
        computed: u32,
    },
    /// Photo row refers to a slot this build does not know
    UnknownSlot { local_id: String, slot: String },
    /// Stored payload no longer decodes into a capture
    UndecodablePayload { local_id: String, message: String },
    /// Database written by an incompatible schema version
    VersionMismatch { found: String, expected: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ChecksumMismatch {
                local_id,
                slot,
                expected,
                computed,
            } => write!(
                f,
                "Corrupted photo '{}' of capture {}: expected CRC32 0x{:08X}, computed 0x{:08X}",
                slot, local_id, expected, computed
            ),
            StoreError::UnknownSlot { local_id, slot } => {
                write!(f, "Capture {} has a photo in unknown slot '{}'", local_id, slot)
            }
            StoreError::UndecodablePayload { local_id, message } => {
                write!(f, "Failed to decode stored capture {}: {}", local_id, message)
            }
            StoreError::VersionMismatch { found, expected } => write!(
                f,
                "Database has unsupported schema version '{}' (expected '{}')",
                found, expected
            ),
        }
    }
}

impl std::error::Error for StoreError {}

/// A record as read back from the store, with its insertion sequence
#[derive(Debug, Clone)]
pub struct StoredCapture {
    pub seq: i64,
    pub record: CaptureRecord,
}

/// A stored row that can no longer be turned back into a capture
#[derive(Debug)]
pub struct DamagedCapture {
    pub seq: i64,
    pub local_id: String,
    pub error: StoreError,
}

/// Result of reading every row. Damage is reported per capture so one bad
/// row never hides the others.
#[derive(Debug, Default)]
pub struct StoreScan {
    pub captures: Vec<StoredCapture>,
    pub damaged: Vec<DamagedCapture>,
}

pub struct LocalStore {
    pool: SqlitePool,
    device_id: String,
}

impl LocalStore {
    /// Open (or create) the store inside `data_dir`
    pub async fn open(data_dir: &Path) -> Result<Self, DynError> {
        let pool = crate::db::open_database_connection(&data_dir.join(LOCAL_STORE_FILE)).await?;
        Self::with_pool(pool).await
    }

    /// Use an already opened pool, initialising the schema if needed
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, DynError> {
        crate::db::init_local_store_schema(&pool).await?;
        let device_id = crate::db::ensure_metadata(&pool).await?;
        Ok(Self { pool, device_id })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Insert or overwrite by `local_id`. Capture row and photos are written
    /// in one transaction.
    pub async fn put(&self, record: &CaptureRecord) -> Result<(), DynError> {
        let payload = serde_json::to_string(record)?;
        let mut tx = self.pool.begin().await?;

        let sql = captures::upsert(
            &record.local_id,
            record.local_created_at.timestamp_millis(),
            &payload,
        );
        sqlx::query(&sql).execute(&mut *tx).await?;

        let sql = captures::delete_photos_by_local_id(&record.local_id);
        sqlx::query(&sql).execute(&mut *tx).await?;

        for photo in &record.photos {
            let sql = captures::insert_photo(
                &record.local_id,
                photo.slot.as_str(),
                &photo.content_type,
                &photo.data,
                crc32fast::hash(&photo.data),
            );
            sqlx::query(&sql).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(
            "Stored capture {} ({} photo(s))",
            record.local_id,
            record.photos.len()
        );
        Ok(())
    }

    /// Remove by key. Returns false when nothing was stored under `local_id`.
    pub async fn delete(&self, local_id: &str) -> Result<bool, DynError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&captures::delete_photos_by_local_id(local_id))
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(&captures::delete_by_local_id(local_id))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Every stored record, in no particular order. Rows with corrupted
    /// photos or an unreadable payload come back in `damaged`.
    pub async fn list_all(&self) -> Result<StoreScan, DynError> {
        let rows = sqlx::query(&captures::select_all())
            .fetch_all(&self.pool)
            .await?;
        let (mut photos, mut photo_errors) = self.load_photos().await?;

        let mut scan = StoreScan::default();
        for row in rows {
            let seq: i64 = row.try_get(0)?;
            let local_id: String = row.try_get(1)?;
            let payload: String = row.try_get(2)?;

            if let Some(error) = photo_errors.remove(&local_id) {
                scan.damaged.push(DamagedCapture {
                    seq,
                    local_id,
                    error,
                });
                continue;
            }

            match serde_json::from_str::<CaptureRecord>(&payload) {
                Ok(mut record) => {
                    record.photos = photos.remove(&local_id).unwrap_or_default();
                    record.photos.sort_by_key(|p| p.slot);
                    scan.captures.push(StoredCapture { seq, record });
                }
                Err(e) => scan.damaged.push(DamagedCapture {
                    seq,
                    local_id: local_id.clone(),
                    error: StoreError::UndecodablePayload {
                        local_id,
                        message: e.to_string(),
                    },
                }),
            }
        }

        Ok(scan)
    }

    pub async fn count(&self) -> Result<usize, DynError> {
        let count: i64 = sqlx::query_scalar(&captures::count())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Remove every record
    pub async fn clear(&self) -> Result<(), DynError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&captures::delete_all_photos())
            .execute(&mut *tx)
            .await?;
        sqlx::query(&captures::delete_all())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Photos grouped by local_id, each verified against its stored checksum.
    /// The second map holds the first problem found for each damaged capture.
    async fn load_photos(
        &self,
    ) -> Result<
        (
            HashMap<String, Vec<PhotoAttachment>>,
            HashMap<String, StoreError>,
        ),
        DynError,
    > {
        let rows = sqlx::query(&captures::select_all_photos())
            .fetch_all(&self.pool)
            .await?;

        let mut grouped: HashMap<String, Vec<PhotoAttachment>> = HashMap::new();
        let mut damaged: HashMap<String, StoreError> = HashMap::new();
        for row in rows {
            let local_id: String = row.try_get(0)?;
            let slot_name: String = row.try_get(1)?;
            let content_type: String = row.try_get(2)?;
            let data: Vec<u8> = row.try_get(3)?;
            let checksum: i64 = row.try_get(4)?;

            if damaged.contains_key(&local_id) {
                continue;
            }

            let expected = checksum as u32;
            let computed = crc32fast::hash(&data);
            if expected != computed {
                damaged.insert(
                    local_id.clone(),
                    StoreError::ChecksumMismatch {
                        local_id,
                        slot: slot_name,
                        expected,
                        computed,
                    },
                );
                continue;
            }

            let slot: PhotoSlot = match slot_name.parse() {
                Ok(slot) => slot,
                Err(_) => {
                    damaged.insert(
                        local_id.clone(),
                        StoreError::UnknownSlot {
                            local_id,
                            slot: slot_name,
                        },
                    );
                    continue;
                }
            };

            grouped.entry(local_id).or_default().push(PhotoAttachment {
                slot,
                content_type,
                data,
            });
        }

        Ok((grouped, damaged))
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
