use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use crate::constants::{generate_device_id, EXPECTED_DB_VERSION};
use crate::queries::{ddl, metadata};
use crate::store::StoreError;
use crate::DynError;

/// Open a file-based database pool for production use
/// Enables WAL mode and foreign keys, creating the file if needed
pub async fn open_database_connection(db_path: &Path) -> Result<SqlitePool, DynError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    log::debug!("SQLite database: {}", db_path.display());
    Ok(pool)
}

/// Create a database in a temporary directory for testing
/// Keep the returned TempDir alive for as long as the pool is used
pub async fn create_test_connection_in_temporary_file(
) -> Result<(SqlitePool, tempfile::TempDir), DynError> {
    let dir = tempfile::tempdir()?;
    let pool = open_database_connection(&dir.path().join("test.sqlite")).await?;
    Ok((pool, dir))
}

/// Create tables for the on-device capture store (idempotent)
pub async fn init_local_store_schema(pool: &SqlitePool) -> Result<(), DynError> {
    sqlx::query(&ddl::create_metadata_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_pending_captures_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_pending_photos_table())
        .execute(pool)
        .await?;
    Ok(())
}

/// Create tables for the central store (idempotent)
pub async fn init_central_store_schema(pool: &SqlitePool) -> Result<(), DynError> {
    sqlx::query(&ddl::create_metadata_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_interventions_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_intervention_photos_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_crew_entries_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_equipment_usage_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_crew_entries_intervention_index())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_equipment_usage_intervention_index())
        .execute(pool)
        .await?;
    Ok(())
}

/// Read a metadata value, None if the key is absent
pub async fn query_metadata(pool: &SqlitePool, key: &str) -> Result<Option<String>, DynError> {
    let sql = metadata::select_by_key(key);
    let value: Option<String> = sqlx::query_scalar(&sql).fetch_optional(pool).await?;
    Ok(value)
}

/// Stamp a fresh database with version and unique_id, or validate the version
/// of an existing one. Returns the database unique_id.
pub async fn ensure_metadata(pool: &SqlitePool) -> Result<String, DynError> {
    match query_metadata(pool, "version").await? {
        Some(version) if version != EXPECTED_DB_VERSION => {
            Err(Box::new(StoreError::VersionMismatch {
                found: version,
                expected: EXPECTED_DB_VERSION.to_string(),
            }))
        }
        Some(_) => query_metadata(pool, "unique_id")
            .await?
            .ok_or_else(|| "Failed to read unique_id from database: key not found".into()),
        None => {
            let unique_id = generate_device_id();
            let mut tx = pool.begin().await?;
            sqlx::query(&metadata::insert("version", EXPECTED_DB_VERSION))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&metadata::insert("unique_id", &unique_id))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(unique_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_metadata_is_stable_across_calls() {
        let (pool, _guard) = create_test_connection_in_temporary_file().await.unwrap();
        init_local_store_schema(&pool).await.unwrap();

        let first = ensure_metadata(&pool).await.unwrap();
        let second = ensure_metadata(&pool).await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("dev_"));
    }

    #[tokio::test]
    async fn test_ensure_metadata_rejects_other_version() {
        let (pool, _guard) = create_test_connection_in_temporary_file().await.unwrap();
        init_local_store_schema(&pool).await.unwrap();
        sqlx::query(&metadata::insert("version", "999"))
            .execute(&pool)
            .await
            .unwrap();

        let err = ensure_metadata(&pool).await.unwrap_err();
        assert!(err.to_string().contains("unsupported schema version"));
    }
}
