use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path as FsPath;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::capture::{CaptureRecord, CrewEntry, EquipmentUsage, PhotoAttachment};
use crate::config::IngestConfig;
use crate::queries::interventions;
use crate::submission::{
    reconstruct, slot_from_part_name, BatchBody, BatchReceipt, ChildrenBody, IngestReceipt,
};
use crate::DynError;

pub struct IngestState {
    pool: SqlitePool,
}

/// Open the central store, creating tables and metadata on first use
pub async fn open_central_store(path: &FsPath) -> Result<SqlitePool, DynError> {
    let pool = crate::db::open_database_connection(path).await?;
    crate::db::init_central_store_schema(&pool).await?;
    let unique_id = crate::db::ensure_metadata(&pool).await?;
    info!("Central store {} (id {})", path.display(), unique_id);
    Ok(pool)
}

pub fn router(pool: SqlitePool, max_body_bytes: usize) -> Router {
    let state = Arc::new(IngestState { pool });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/interventions", post(create_intervention_handler))
        .route("/api/interventions/batch", post(batch_handler))
        .route("/api/interventions/{id}", get(get_intervention_handler))
        .route("/api/interventions/{id}/children", post(attach_children_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(config: IngestConfig) -> Result<(), DynError> {
    let pool = open_central_store(&config.database_path).await?;
    let app = router(pool, config.max_body_bytes());

    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", config.api_port))
        .await
        .map_err(|e| format!("Failed to bind port {}: {}", config.api_port, e))?;

    println!("Listening on: http://[::]:{} (IPv4 + IPv6)", config.api_port);
    println!("Endpoints:");
    println!("  GET  /health  - Health check");
    println!("  POST /api/interventions  - Submit one capture (multipart)");
    println!("  POST /api/interventions/batch  - Submit captures without photos (JSON)");
    println!("  GET  /api/interventions/:id  - Stored intervention");
    println!("  POST /api/interventions/:id/children  - Attach missing crew/equipment");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Store one validated capture.
///
/// The primary row and its photos commit together; a capture already stored
/// under the same local_id is left untouched. Crew and equipment are written
/// afterwards, each on its own, and only when the intervention has none yet.
/// A child failure is logged and reported in the receipt.
pub async fn ingest_record(
    pool: &SqlitePool,
    record: &CaptureRecord,
) -> Result<IngestReceipt, DynError> {
    let received_at_ms = chrono::Utc::now().timestamp_millis();

    let mut tx = pool.begin().await?;
    let created = sqlx::query(&interventions::insert_or_ignore(record, received_at_ms))
        .execute(&mut *tx)
        .await?
        .rows_affected()
        > 0;
    let id: i64 = sqlx::query_scalar(&interventions::select_id_by_local_id(&record.local_id))
        .fetch_one(&mut *tx)
        .await?;
    if created {
        for photo in &record.photos {
            sqlx::query(&interventions::upsert_photo(id, photo))
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;

    if created {
        info!(
            "Stored intervention {} for capture {} ({} photo(s))",
            id,
            record.local_id,
            record.photos.len()
        );
    } else {
        info!(
            "Capture {} already stored as intervention {}",
            record.local_id, id
        );
    }

    let (crew_persisted, equipment_persisted) = attach_children(
        pool,
        id,
        &record.transmittable_crew(),
        &record.transmittable_equipment(),
    )
    .await;

    Ok(IngestReceipt {
        id,
        local_id: record.local_id.clone(),
        created,
        crew_persisted,
        equipment_persisted,
    })
}

/// Write each child collection if the intervention has none stored yet.
/// Returns whether each collection is now persisted.
async fn attach_children(
    pool: &SqlitePool,
    id: i64,
    crew: &[CrewEntry],
    equipment: &[EquipmentUsage],
) -> (bool, bool) {
    let crew_persisted = match write_crew(pool, id, crew).await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to store crew for intervention {}: {}", id, e);
            false
        }
    };
    let equipment_persisted = match write_equipment(pool, id, equipment).await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to store equipment for intervention {}: {}", id, e);
            false
        }
    };
    (crew_persisted, equipment_persisted)
}

async fn write_crew(pool: &SqlitePool, id: i64, crew: &[CrewEntry]) -> Result<(), DynError> {
    if crew.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    let existing: i64 = sqlx::query_scalar(&interventions::count_crew(id))
        .fetch_one(&mut *tx)
        .await?;
    if existing == 0 {
        sqlx::query(&interventions::insert_crew(id, crew))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn write_equipment(
    pool: &SqlitePool,
    id: i64,
    equipment: &[EquipmentUsage],
) -> Result<(), DynError> {
    if equipment.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    let existing: i64 = sqlx::query_scalar(&interventions::count_equipment(id))
        .fetch_one(&mut *tx)
        .await?;
    if existing == 0 {
        sqlx::query(&interventions::insert_equipment(id, equipment))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({"error": message.into()})),
    )
        .into_response()
}

// Health check endpoint - returns 200 OK if server is running
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn create_intervention_handler(
    State(state): State<Arc<IngestState>>,
    mut multipart: Multipart,
) -> Response {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut photos: Vec<PhotoAttachment> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("Malformed multipart body: {}", e))
            }
        };
        let name = field.name().unwrap_or_default().to_string();

        match slot_from_part_name(&name) {
            Some(Ok(slot)) => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = match field.bytes().await {
                    Ok(data) => data,
                    Err(e) => {
                        return error_response(
                            StatusCode::BAD_REQUEST,
                            format!("Failed to read photo '{}': {}", name, e),
                        )
                    }
                };
                photos.push(PhotoAttachment {
                    slot,
                    content_type,
                    data: data.to_vec(),
                });
            }
            Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e),
            None => {
                let value = match field.text().await {
                    Ok(value) => value,
                    Err(e) => {
                        return error_response(
                            StatusCode::BAD_REQUEST,
                            format!("Failed to read field '{}': {}", name, e),
                        )
                    }
                };
                fields.insert(name, value);
            }
        }
    }

    let record = match reconstruct(&fields, photos) {
        Ok(record) => record,
        Err(e) => {
            warn!("Rejected submission: {}", e);
            return error_response(StatusCode::BAD_REQUEST, e.message);
        }
    };

    match ingest_record(&state.pool, &record).await {
        Ok(receipt) => {
            let status = if receipt.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(receipt)).into_response()
        }
        Err(e) => {
            error!("Failed to store capture {}: {}", record.local_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e))
        }
    }
}

async fn batch_handler(
    State(state): State<Arc<IngestState>>,
    Json(body): Json<BatchBody>,
) -> Response {
    let total = body.records.len();
    let mut accepted = 0;

    for record in &body.records {
        if let Err(e) = record.validate() {
            warn!("Skipping batched capture {}: {}", record.local_id, e);
            continue;
        }
        match ingest_record(&state.pool, record).await {
            Ok(_) => accepted += 1,
            Err(e) => {
                error!("Failed to store batched capture {}: {}", record.local_id, e);
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Database error: {}", e),
                );
            }
        }
    }

    info!("Batch: accepted {} of {}", accepted, total);
    (StatusCode::OK, Json(BatchReceipt { accepted })).into_response()
}

fn check_children(body: &ChildrenBody) -> Result<(), String> {
    for entry in &body.crew {
        if entry.crew_type.trim().is_empty() || !entry.hours.is_finite() || entry.hours < 0.0 {
            return Err(format!("Invalid crew entry '{}'", entry.crew_type));
        }
    }
    for entry in &body.equipment {
        if entry.item.trim().is_empty() || !entry.hours.is_finite() || entry.hours < 0.0 {
            return Err(format!("Invalid equipment entry '{}'", entry.item));
        }
    }
    Ok(())
}

async fn attach_children_handler(
    State(state): State<Arc<IngestState>>,
    Path(id): Path<i64>,
    Json(body): Json<ChildrenBody>,
) -> Response {
    if let Err(e) = check_children(&body) {
        return error_response(StatusCode::BAD_REQUEST, e);
    }

    match sqlx::query(&interventions::select_by_id(id))
        .fetch_optional(&state.pool)
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("Intervention {} not found", id),
            )
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Database error: {}", e),
            )
        }
    }

    let crew: Vec<CrewEntry> = body.crew.into_iter().filter(|c| c.has_usage()).collect();
    let equipment: Vec<EquipmentUsage> = body
        .equipment
        .into_iter()
        .filter(|e| e.has_usage())
        .collect();

    let (crew_persisted, equipment_persisted) =
        attach_children(&state.pool, id, &crew, &equipment).await;
    let status = if crew_persisted && equipment_persisted {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(serde_json::json!({
            "id": id,
            "crew_persisted": crew_persisted,
            "equipment_persisted": equipment_persisted,
        })),
    )
        .into_response()
}

/// Stored aggregate as returned by `GET /api/interventions/{id}`
#[derive(Debug, Serialize)]
pub struct InterventionView {
    pub id: i64,
    pub local_id: String,
    pub location_code: String,
    pub district_code: Option<String>,
    pub site_name: Option<String>,
    pub street_address: Option<String>,
    pub landmark: Option<String>,
    pub work_order: Option<String>,
    pub units_completed: i64,
    pub households_reached: i64,
    pub performed_on: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub notes: Option<String>,
    pub submitted_lat: Option<f64>,
    pub submitted_lng: Option<f64>,
    pub received_at_ms: i64,
    pub photo_slots: Vec<String>,
    pub crew: Vec<CrewEntry>,
    pub equipment: Vec<EquipmentUsage>,
}

pub async fn load_intervention(
    pool: &SqlitePool,
    id: i64,
) -> Result<Option<InterventionView>, DynError> {
    let row = match sqlx::query(&interventions::select_by_id(id))
        .fetch_optional(pool)
        .await?
    {
        Some(row) => row,
        None => return Ok(None),
    };

    let photo_slots: Vec<String> = sqlx::query_scalar(&interventions::select_photo_slots(id))
        .fetch_all(pool)
        .await?;

    let mut crew = Vec::new();
    for r in sqlx::query(&interventions::select_crew(id))
        .fetch_all(pool)
        .await?
    {
        let count: i64 = r.try_get(1)?;
        crew.push(CrewEntry {
            crew_type: r.try_get(0)?,
            count: count as u32,
            hours: r.try_get(2)?,
        });
    }

    let mut equipment = Vec::new();
    for r in sqlx::query(&interventions::select_equipment(id))
        .fetch_all(pool)
        .await?
    {
        equipment.push(EquipmentUsage {
            item: r.try_get(0)?,
            hours: r.try_get(1)?,
        });
    }

    Ok(Some(InterventionView {
        id: row.try_get(0)?,
        local_id: row.try_get(1)?,
        location_code: row.try_get(2)?,
        district_code: row.try_get(3)?,
        site_name: row.try_get(4)?,
        street_address: row.try_get(5)?,
        landmark: row.try_get(6)?,
        work_order: row.try_get(7)?,
        units_completed: row.try_get(8)?,
        households_reached: row.try_get(9)?,
        performed_on: row.try_get(10)?,
        started_at: row.try_get(11)?,
        finished_at: row.try_get(12)?,
        notes: row.try_get(13)?,
        submitted_lat: row.try_get(14)?,
        submitted_lng: row.try_get(15)?,
        received_at_ms: row.try_get(16)?,
        photo_slots,
        crew,
        equipment,
    }))
}

async fn get_intervention_handler(
    State(state): State<Arc<IngestState>>,
    Path(id): Path<i64>,
) -> Response {
    match load_intervention(&state.pool, id).await {
        Ok(Some(view)) => (StatusCode::OK, Json(view)).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("Intervention {} not found", id),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Database error: {}", e),
        ),
    }
}
