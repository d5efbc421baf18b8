use sea_query::{ColumnDef, ForeignKey, ForeignKeyAction, Index, SqliteQueryBuilder, Table};

use crate::schema::{
    CrewEntries, EquipmentUsage, InterventionPhotos, Interventions, Metadata, PendingCaptures,
    PendingPhotos,
};

/// CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)
pub fn create_metadata_table() -> String {
    Table::create()
        .table(Metadata::Table)
        .if_not_exists()
        .col(ColumnDef::new(Metadata::Key).string().primary_key())
        .col(ColumnDef::new(Metadata::Value).string().not_null())
        .to_string(SqliteQueryBuilder)
}

// ============================================================================
// On-device store
// ============================================================================

/// CREATE TABLE IF NOT EXISTS pending_captures (
///     seq INTEGER PRIMARY KEY AUTOINCREMENT,
///     local_id TEXT NOT NULL UNIQUE,
///     created_at_ms INTEGER NOT NULL,
///     payload TEXT NOT NULL
/// )
pub fn create_pending_captures_table() -> String {
    Table::create()
        .table(PendingCaptures::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(PendingCaptures::Seq)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(
            ColumnDef::new(PendingCaptures::LocalId)
                .string()
                .not_null()
                .unique_key(),
        )
        .col(
            ColumnDef::new(PendingCaptures::CreatedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(PendingCaptures::Payload).text().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS pending_photos (
///     local_id TEXT NOT NULL REFERENCES pending_captures(local_id) ON DELETE CASCADE,
///     slot TEXT NOT NULL,
///     content_type TEXT NOT NULL,
///     data BLOB NOT NULL,
///     checksum INTEGER NOT NULL,
///     PRIMARY KEY (local_id, slot)
/// )
pub fn create_pending_photos_table() -> String {
    Table::create()
        .table(PendingPhotos::Table)
        .if_not_exists()
        .col(ColumnDef::new(PendingPhotos::LocalId).string().not_null())
        .col(ColumnDef::new(PendingPhotos::Slot).string().not_null())
        .col(ColumnDef::new(PendingPhotos::ContentType).string().not_null())
        .col(ColumnDef::new(PendingPhotos::Data).blob().not_null())
        .col(ColumnDef::new(PendingPhotos::Checksum).big_integer().not_null())
        .primary_key(
            Index::create()
                .col(PendingPhotos::LocalId)
                .col(PendingPhotos::Slot),
        )
        .foreign_key(
            ForeignKey::create()
                .from(PendingPhotos::Table, PendingPhotos::LocalId)
                .to(PendingCaptures::Table, PendingCaptures::LocalId)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

// ============================================================================
// Central store
// ============================================================================

/// CREATE TABLE IF NOT EXISTS interventions (...)
/// local_id is unique so a re-uploaded capture maps to the existing row
pub fn create_interventions_table() -> String {
    Table::create()
        .table(Interventions::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Interventions::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(
            ColumnDef::new(Interventions::LocalId)
                .string()
                .not_null()
                .unique_key(),
        )
        .col(ColumnDef::new(Interventions::LocationCode).string().not_null())
        .col(ColumnDef::new(Interventions::DistrictCode).string())
        .col(ColumnDef::new(Interventions::SiteName).string())
        .col(ColumnDef::new(Interventions::StreetAddress).string())
        .col(ColumnDef::new(Interventions::Landmark).string())
        .col(ColumnDef::new(Interventions::WorkOrder).string())
        .col(
            ColumnDef::new(Interventions::UnitsCompleted)
                .integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(Interventions::HouseholdsReached)
                .integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(Interventions::PerformedOn).string().not_null())
        .col(ColumnDef::new(Interventions::StartedAt).string())
        .col(ColumnDef::new(Interventions::FinishedAt).string())
        .col(ColumnDef::new(Interventions::Notes).text())
        .col(ColumnDef::new(Interventions::CapturedLat).double())
        .col(ColumnDef::new(Interventions::CapturedLng).double())
        .col(ColumnDef::new(Interventions::CorrectedLat).double())
        .col(ColumnDef::new(Interventions::CorrectedLng).double())
        .col(ColumnDef::new(Interventions::SubmittedLat).double())
        .col(ColumnDef::new(Interventions::SubmittedLng).double())
        .col(
            ColumnDef::new(Interventions::LocalCreatedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(Interventions::ReceivedAtMs)
                .big_integer()
                .not_null(),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS intervention_photos (
///     intervention_id INTEGER NOT NULL REFERENCES interventions(id) ON DELETE CASCADE,
///     slot TEXT NOT NULL,
///     content_type TEXT NOT NULL,
///     data BLOB NOT NULL,
///     PRIMARY KEY (intervention_id, slot)
/// )
pub fn create_intervention_photos_table() -> String {
    Table::create()
        .table(InterventionPhotos::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(InterventionPhotos::InterventionId)
                .integer()
                .not_null(),
        )
        .col(ColumnDef::new(InterventionPhotos::Slot).string().not_null())
        .col(
            ColumnDef::new(InterventionPhotos::ContentType)
                .string()
                .not_null(),
        )
        .col(ColumnDef::new(InterventionPhotos::Data).blob().not_null())
        .primary_key(
            Index::create()
                .col(InterventionPhotos::InterventionId)
                .col(InterventionPhotos::Slot),
        )
        .foreign_key(
            ForeignKey::create()
                .from(InterventionPhotos::Table, InterventionPhotos::InterventionId)
                .to(Interventions::Table, Interventions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS crew_entries (...)
pub fn create_crew_entries_table() -> String {
    Table::create()
        .table(CrewEntries::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(CrewEntries::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(
            ColumnDef::new(CrewEntries::InterventionId)
                .integer()
                .not_null(),
        )
        .col(ColumnDef::new(CrewEntries::CrewType).string().not_null())
        .col(ColumnDef::new(CrewEntries::MemberCount).integer().not_null())
        .col(ColumnDef::new(CrewEntries::Hours).double().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(CrewEntries::Table, CrewEntries::InterventionId)
                .to(Interventions::Table, Interventions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS equipment_usage (...)
pub fn create_equipment_usage_table() -> String {
    Table::create()
        .table(EquipmentUsage::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(EquipmentUsage::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(
            ColumnDef::new(EquipmentUsage::InterventionId)
                .integer()
                .not_null(),
        )
        .col(ColumnDef::new(EquipmentUsage::Item).string().not_null())
        .col(ColumnDef::new(EquipmentUsage::Hours).double().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(EquipmentUsage::Table, EquipmentUsage::InterventionId)
                .to(Interventions::Table, Interventions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_crew_entries_intervention ON crew_entries(intervention_id)
pub fn create_crew_entries_intervention_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_crew_entries_intervention")
        .table(CrewEntries::Table)
        .col(CrewEntries::InterventionId)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_equipment_usage_intervention ON equipment_usage(intervention_id)
pub fn create_equipment_usage_intervention_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_equipment_usage_intervention")
        .table(EquipmentUsage::Table)
        .col(EquipmentUsage::InterventionId)
        .to_string(SqliteQueryBuilder)
}
