use sea_query::{Expr, Func, OnConflict, Order, Query, SqliteQueryBuilder};

use crate::capture::{CaptureRecord, CrewEntry, EquipmentUsage as UsageEntry, PhotoAttachment};
use crate::schema::{CrewEntries, EquipmentUsage, InterventionPhotos, Interventions};

/// INSERT INTO interventions (...) VALUES (...) ON CONFLICT (local_id) DO NOTHING
///
/// rows_affected() == 0 means the capture was already ingested.
pub fn insert_or_ignore(record: &CaptureRecord, received_at_ms: i64) -> String {
    let lat = |c: Option<crate::capture::Coordinates>| c.map(|c| c.lat);
    let lng = |c: Option<crate::capture::Coordinates>| c.map(|c| c.lng);

    Query::insert()
        .into_table(Interventions::Table)
        .columns([
            Interventions::LocalId,
            Interventions::LocationCode,
            Interventions::DistrictCode,
            Interventions::SiteName,
            Interventions::StreetAddress,
            Interventions::Landmark,
            Interventions::WorkOrder,
            Interventions::UnitsCompleted,
            Interventions::HouseholdsReached,
            Interventions::PerformedOn,
            Interventions::StartedAt,
            Interventions::FinishedAt,
            Interventions::Notes,
            Interventions::CapturedLat,
            Interventions::CapturedLng,
            Interventions::CorrectedLat,
            Interventions::CorrectedLng,
            Interventions::SubmittedLat,
            Interventions::SubmittedLng,
            Interventions::LocalCreatedAtMs,
            Interventions::ReceivedAtMs,
        ])
        .values_panic([
            record.local_id.as_str().into(),
            record.location_code.as_str().into(),
            record.district_code.clone().into(),
            record.site_name.clone().into(),
            record.street_address.clone().into(),
            record.landmark.clone().into(),
            record.work_order.clone().into(),
            record.units_completed.into(),
            record.households_reached.into(),
            record.performed_on.format("%Y-%m-%d").to_string().into(),
            record
                .started_at
                .map(|t| t.format("%H:%M:%S").to_string())
                .into(),
            record
                .finished_at
                .map(|t| t.format("%H:%M:%S").to_string())
                .into(),
            record.notes.clone().into(),
            lat(record.geo.captured).into(),
            lng(record.geo.captured).into(),
            lat(record.geo.corrected).into(),
            lng(record.geo.corrected).into(),
            lat(record.geo.at_submission).into(),
            lng(record.geo.at_submission).into(),
            record.local_created_at.timestamp_millis().into(),
            received_at_ms.into(),
        ])
        .on_conflict(
            OnConflict::column(Interventions::LocalId)
                .do_nothing()
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}

/// SELECT id FROM interventions WHERE local_id = ?
pub fn select_id_by_local_id(local_id: &str) -> String {
    Query::select()
        .column(Interventions::Id)
        .from(Interventions::Table)
        .and_where(Expr::col(Interventions::LocalId).eq(local_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT local_id, location_code, ..., received_at_ms FROM interventions WHERE id = ?
pub fn select_by_id(id: i64) -> String {
    Query::select()
        .columns([
            Interventions::Id,
            Interventions::LocalId,
            Interventions::LocationCode,
            Interventions::DistrictCode,
            Interventions::SiteName,
            Interventions::StreetAddress,
            Interventions::Landmark,
            Interventions::WorkOrder,
            Interventions::UnitsCompleted,
            Interventions::HouseholdsReached,
            Interventions::PerformedOn,
            Interventions::StartedAt,
            Interventions::FinishedAt,
            Interventions::Notes,
            Interventions::SubmittedLat,
            Interventions::SubmittedLng,
            Interventions::ReceivedAtMs,
        ])
        .from(Interventions::Table)
        .and_where(Expr::col(Interventions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO intervention_photos (intervention_id, slot, content_type, data) VALUES (?, ?, ?, ?)
/// ON CONFLICT DO UPDATE: a re-upload refreshes the stored bytes
pub fn upsert_photo(intervention_id: i64, photo: &PhotoAttachment) -> String {
    Query::insert()
        .into_table(InterventionPhotos::Table)
        .columns([
            InterventionPhotos::InterventionId,
            InterventionPhotos::Slot,
            InterventionPhotos::ContentType,
            InterventionPhotos::Data,
        ])
        .values_panic([
            intervention_id.into(),
            photo.slot.as_str().into(),
            photo.content_type.as_str().into(),
            photo.data.clone().into(),
        ])
        .on_conflict(
            OnConflict::columns([InterventionPhotos::InterventionId, InterventionPhotos::Slot])
                .update_columns([InterventionPhotos::ContentType, InterventionPhotos::Data])
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}

/// SELECT slot FROM intervention_photos WHERE intervention_id = ? ORDER BY slot
pub fn select_photo_slots(intervention_id: i64) -> String {
    Query::select()
        .column(InterventionPhotos::Slot)
        .from(InterventionPhotos::Table)
        .and_where(Expr::col(InterventionPhotos::InterventionId).eq(intervention_id))
        .order_by(InterventionPhotos::Slot, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

// ============================================================================
// Child collections
// ============================================================================

/// INSERT INTO crew_entries (intervention_id, crew_type, member_count, hours) VALUES (...), (...)
pub fn insert_crew(intervention_id: i64, entries: &[CrewEntry]) -> String {
    let mut query = Query::insert();
    query.into_table(CrewEntries::Table).columns([
        CrewEntries::InterventionId,
        CrewEntries::CrewType,
        CrewEntries::MemberCount,
        CrewEntries::Hours,
    ]);
    for entry in entries {
        query.values_panic([
            intervention_id.into(),
            entry.crew_type.as_str().into(),
            entry.count.into(),
            entry.hours.into(),
        ]);
    }
    query.to_string(SqliteQueryBuilder)
}

/// INSERT INTO equipment_usage (intervention_id, item, hours) VALUES (...), (...)
pub fn insert_equipment(intervention_id: i64, entries: &[UsageEntry]) -> String {
    let mut query = Query::insert();
    query.into_table(EquipmentUsage::Table).columns([
        EquipmentUsage::InterventionId,
        EquipmentUsage::Item,
        EquipmentUsage::Hours,
    ]);
    for entry in entries {
        query.values_panic([
            intervention_id.into(),
            entry.item.as_str().into(),
            entry.hours.into(),
        ]);
    }
    query.to_string(SqliteQueryBuilder)
}

/// SELECT COUNT(*) FROM crew_entries WHERE intervention_id = ?
pub fn count_crew(intervention_id: i64) -> String {
    Query::select()
        .expr(Func::count(Expr::col(CrewEntries::Id)))
        .from(CrewEntries::Table)
        .and_where(Expr::col(CrewEntries::InterventionId).eq(intervention_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT COUNT(*) FROM equipment_usage WHERE intervention_id = ?
pub fn count_equipment(intervention_id: i64) -> String {
    Query::select()
        .expr(Func::count(Expr::col(EquipmentUsage::Id)))
        .from(EquipmentUsage::Table)
        .and_where(Expr::col(EquipmentUsage::InterventionId).eq(intervention_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT crew_type, member_count, hours FROM crew_entries WHERE intervention_id = ? ORDER BY id
pub fn select_crew(intervention_id: i64) -> String {
    Query::select()
        .columns([
            CrewEntries::CrewType,
            CrewEntries::MemberCount,
            CrewEntries::Hours,
        ])
        .from(CrewEntries::Table)
        .and_where(Expr::col(CrewEntries::InterventionId).eq(intervention_id))
        .order_by(CrewEntries::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT item, hours FROM equipment_usage WHERE intervention_id = ? ORDER BY id
pub fn select_equipment(intervention_id: i64) -> String {
    Query::select()
        .columns([EquipmentUsage::Item, EquipmentUsage::Hours])
        .from(EquipmentUsage::Table)
        .and_where(Expr::col(EquipmentUsage::InterventionId).eq(intervention_id))
        .order_by(EquipmentUsage::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}
