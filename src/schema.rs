use sea_query::Iden;

/// Metadata table - key-value store for database configuration
#[derive(Iden)]
pub enum Metadata {
    Table,
    Key,
    Value,
}

/// Pending captures - on-device queue rows, one per Capture Record
#[derive(Iden)]
pub enum PendingCaptures {
    Table,
    Seq,
    LocalId,
    CreatedAtMs,
    Payload,
}

/// Pending photos - binary attachments of queued captures
#[derive(Iden)]
pub enum PendingPhotos {
    Table,
    LocalId,
    Slot,
    ContentType,
    Data,
    Checksum,
}

/// Interventions - primary records in the central store
#[derive(Iden)]
pub enum Interventions {
    Table,
    Id,
    LocalId,
    LocationCode,
    DistrictCode,
    SiteName,
    StreetAddress,
    Landmark,
    WorkOrder,
    UnitsCompleted,
    HouseholdsReached,
    PerformedOn,
    StartedAt,
    FinishedAt,
    Notes,
    CapturedLat,
    CapturedLng,
    CorrectedLat,
    CorrectedLng,
    SubmittedLat,
    SubmittedLng,
    LocalCreatedAtMs,
    ReceivedAtMs,
}

/// Intervention photos - stored with the primary record
#[derive(Iden)]
pub enum InterventionPhotos {
    Table,
    InterventionId,
    Slot,
    ContentType,
    Data,
}

/// Crew entries - child collection of an intervention
#[derive(Iden)]
pub enum CrewEntries {
    Table,
    Id,
    InterventionId,
    CrewType,
    MemberCount,
    Hours,
}

/// Equipment usage - child collection of an intervention
#[derive(Iden)]
pub enum EquipmentUsage {
    Table,
    Id,
    InterventionId,
    Item,
    Hours,
}
