use sea_query::{Expr, Func, OnConflict, Query, SqliteQueryBuilder};

use crate::schema::{PendingCaptures, PendingPhotos};

/// INSERT INTO pending_captures (local_id, created_at_ms, payload) VALUES (?, ?, ?)
/// ON CONFLICT (local_id) DO UPDATE SET created_at_ms = excluded.created_at_ms, payload = excluded.payload
///
/// An overwrite keeps the row's original seq, so queue position is stable.
pub fn upsert(local_id: &str, created_at_ms: i64, payload: &str) -> String {
    Query::insert()
        .into_table(PendingCaptures::Table)
        .columns([
            PendingCaptures::LocalId,
            PendingCaptures::CreatedAtMs,
            PendingCaptures::Payload,
        ])
        .values_panic([local_id.into(), created_at_ms.into(), payload.into()])
        .on_conflict(
            OnConflict::column(PendingCaptures::LocalId)
                .update_columns([PendingCaptures::CreatedAtMs, PendingCaptures::Payload])
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM pending_captures WHERE local_id = ?
pub fn delete_by_local_id(local_id: &str) -> String {
    Query::delete()
        .from_table(PendingCaptures::Table)
        .and_where(Expr::col(PendingCaptures::LocalId).eq(local_id))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM pending_captures
pub fn delete_all() -> String {
    Query::delete()
        .from_table(PendingCaptures::Table)
        .to_string(SqliteQueryBuilder)
}

/// SELECT seq, local_id, payload FROM pending_captures
/// No ORDER BY: ordering is the queue's job
pub fn select_all() -> String {
    Query::select()
        .columns([
            PendingCaptures::Seq,
            PendingCaptures::LocalId,
            PendingCaptures::Payload,
        ])
        .from(PendingCaptures::Table)
        .to_string(SqliteQueryBuilder)
}

/// SELECT COUNT(*) FROM pending_captures
pub fn count() -> String {
    Query::select()
        .expr(Func::count(Expr::col(PendingCaptures::Seq)))
        .from(PendingCaptures::Table)
        .to_string(SqliteQueryBuilder)
}

// ============================================================================
// Photos
// ============================================================================

/// INSERT INTO pending_photos (local_id, slot, content_type, data, checksum) VALUES (?, ?, ?, ?, ?)
pub fn insert_photo(
    local_id: &str,
    slot: &str,
    content_type: &str,
    data: &[u8],
    checksum: u32,
) -> String {
    Query::insert()
        .into_table(PendingPhotos::Table)
        .columns([
            PendingPhotos::LocalId,
            PendingPhotos::Slot,
            PendingPhotos::ContentType,
            PendingPhotos::Data,
            PendingPhotos::Checksum,
        ])
        .values_panic([
            local_id.into(),
            slot.into(),
            content_type.into(),
            data.to_vec().into(),
            (checksum as i64).into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM pending_photos WHERE local_id = ?
pub fn delete_photos_by_local_id(local_id: &str) -> String {
    Query::delete()
        .from_table(PendingPhotos::Table)
        .and_where(Expr::col(PendingPhotos::LocalId).eq(local_id))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM pending_photos
pub fn delete_all_photos() -> String {
    Query::delete()
        .from_table(PendingPhotos::Table)
        .to_string(SqliteQueryBuilder)
}

/// SELECT local_id, slot, content_type, data, checksum FROM pending_photos
pub fn select_all_photos() -> String {
    Query::select()
        .columns([
            PendingPhotos::LocalId,
            PendingPhotos::Slot,
            PendingPhotos::ContentType,
            PendingPhotos::Data,
            PendingPhotos::Checksum,
        ])
        .from(PendingPhotos::Table)
        .to_string(SqliteQueryBuilder)
}
