//! Wire contract shared by the transport client and the ingest handler.
//!
//! A single capture travels as `multipart/form-data`: scalar fields as text
//! parts, `crew` and `equipment` as JSON text parts, one binary part per
//! photo named `photo_<slot>`. Batches and child follow-ups are plain JSON.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::capture::{
    CaptureRecord, Coordinates, CrewEntry, EquipmentUsage, GeoFields, PhotoAttachment, PhotoSlot,
    ValidationError,
};

pub const FIELD_LOCAL_ID: &str = "local_id";
pub const FIELD_LOCATION_CODE: &str = "location_code";
pub const FIELD_DISTRICT_CODE: &str = "district_code";
pub const FIELD_SITE_NAME: &str = "site_name";
pub const FIELD_STREET_ADDRESS: &str = "street_address";
pub const FIELD_LANDMARK: &str = "landmark";
pub const FIELD_WORK_ORDER: &str = "work_order";
pub const FIELD_UNITS_COMPLETED: &str = "units_completed";
pub const FIELD_HOUSEHOLDS_REACHED: &str = "households_reached";
pub const FIELD_PERFORMED_ON: &str = "performed_on";
pub const FIELD_STARTED_AT: &str = "started_at";
pub const FIELD_FINISHED_AT: &str = "finished_at";
pub const FIELD_NOTES: &str = "notes";
pub const FIELD_LOCAL_CREATED_AT: &str = "local_created_at";
pub const FIELD_CREW: &str = "crew";
pub const FIELD_EQUIPMENT: &str = "equipment";

const PHOTO_PREFIX: &str = "photo_";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

/// Multipart part name carrying the photo of `slot`
pub fn photo_part_name(slot: PhotoSlot) -> String {
    format!("{}{}", PHOTO_PREFIX, slot.as_str())
}

/// Slot addressed by a multipart part name, None for non-photo parts
pub fn slot_from_part_name(name: &str) -> Option<Result<PhotoSlot, String>> {
    name.strip_prefix(PHOTO_PREFIX).map(|slot| slot.parse())
}

/// Text parts for `record`. Zero-usage crew and equipment entries are
/// left out; absent optional fields produce no part at all.
pub fn form_fields(record: &CaptureRecord) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
    let mut fields = vec![
        (FIELD_LOCAL_ID, record.local_id.clone()),
        (FIELD_LOCATION_CODE, record.location_code.clone()),
        (FIELD_UNITS_COMPLETED, record.units_completed.to_string()),
        (FIELD_HOUSEHOLDS_REACHED, record.households_reached.to_string()),
        (
            FIELD_PERFORMED_ON,
            record.performed_on.format(DATE_FORMAT).to_string(),
        ),
        (FIELD_LOCAL_CREATED_AT, record.local_created_at.to_rfc3339()),
    ];

    let optional = [
        (FIELD_DISTRICT_CODE, &record.district_code),
        (FIELD_SITE_NAME, &record.site_name),
        (FIELD_STREET_ADDRESS, &record.street_address),
        (FIELD_LANDMARK, &record.landmark),
        (FIELD_WORK_ORDER, &record.work_order),
        (FIELD_NOTES, &record.notes),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            fields.push((name, value.clone()));
        }
    }

    if let Some(t) = record.started_at {
        fields.push((FIELD_STARTED_AT, t.format(TIME_FORMAT).to_string()));
    }
    if let Some(t) = record.finished_at {
        fields.push((FIELD_FINISHED_AT, t.format(TIME_FORMAT).to_string()));
    }

    let coords = [
        ("captured_lat", "captured_lng", record.geo.captured),
        ("corrected_lat", "corrected_lng", record.geo.corrected),
        ("submitted_lat", "submitted_lng", record.geo.at_submission),
    ];
    for (lat_name, lng_name, value) in coords {
        if let Some(c) = value {
            fields.push((lat_name, c.lat.to_string()));
            fields.push((lng_name, c.lng.to_string()));
        }
    }

    fields.push((
        FIELD_CREW,
        serde_json::to_string(&record.transmittable_crew())?,
    ));
    fields.push((
        FIELD_EQUIPMENT,
        serde_json::to_string(&record.transmittable_equipment())?,
    ));

    Ok(fields)
}

/// Rebuild a record from received text parts and photos, then validate it
pub fn reconstruct(
    fields: &HashMap<String, String>,
    photos: Vec<PhotoAttachment>,
) -> Result<CaptureRecord, ValidationError> {
    let required = |name: &str| -> Result<String, ValidationError> {
        fields
            .get(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ValidationError::new(format!("missing field '{}'", name)))
    };
    let optional = |name: &str| -> Option<String> {
        fields
            .get(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let performed_on_raw = required(FIELD_PERFORMED_ON)?;
    let performed_on = NaiveDate::parse_from_str(&performed_on_raw, DATE_FORMAT).map_err(|e| {
        ValidationError::new(format!("invalid performed_on '{}': {}", performed_on_raw, e))
    })?;

    let local_created_at = match optional(FIELD_LOCAL_CREATED_AT) {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| ValidationError::new(format!("invalid local_created_at '{}': {}", raw, e)))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let crew: Vec<CrewEntry> = parse_json_part(fields, FIELD_CREW)?;
    let equipment: Vec<EquipmentUsage> = parse_json_part(fields, FIELD_EQUIPMENT)?;

    let mut record = CaptureRecord {
        local_id: required(FIELD_LOCAL_ID)?,
        location_code: required(FIELD_LOCATION_CODE)?,
        district_code: optional(FIELD_DISTRICT_CODE),
        site_name: optional(FIELD_SITE_NAME),
        street_address: optional(FIELD_STREET_ADDRESS),
        landmark: optional(FIELD_LANDMARK),
        work_order: optional(FIELD_WORK_ORDER),
        units_completed: parse_count(fields, FIELD_UNITS_COMPLETED)?,
        households_reached: parse_count(fields, FIELD_HOUSEHOLDS_REACHED)?,
        performed_on,
        started_at: parse_time(fields, FIELD_STARTED_AT)?,
        finished_at: parse_time(fields, FIELD_FINISHED_AT)?,
        notes: optional(FIELD_NOTES),
        geo: GeoFields {
            captured: parse_coords(fields, "captured_lat", "captured_lng")?,
            corrected: parse_coords(fields, "corrected_lat", "corrected_lng")?,
            at_submission: parse_coords(fields, "submitted_lat", "submitted_lng")?,
        },
        photos: Vec::new(),
        crew,
        equipment,
        is_synced: false,
        local_created_at,
    };

    for photo in photos {
        if record.photos.iter().any(|p| p.slot == photo.slot) {
            return Err(ValidationError::new(format!(
                "duplicate photo for slot '{}'",
                photo.slot
            )));
        }
        record.photos.push(photo);
    }
    record.photos.sort_by_key(|p| p.slot);

    record.validate()?;
    Ok(record)
}

fn parse_count(fields: &HashMap<String, String>, name: &str) -> Result<u32, ValidationError> {
    match fields.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| ValidationError::new(format!("invalid {} '{}'", name, raw))),
    }
}

fn parse_time(
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<Option<NaiveTime>, ValidationError> {
    match fields.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => NaiveTime::parse_from_str(raw, TIME_FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
            .map(Some)
            .map_err(|_| ValidationError::new(format!("invalid {} '{}'", name, raw))),
    }
}

fn parse_coords(
    fields: &HashMap<String, String>,
    lat_name: &str,
    lng_name: &str,
) -> Result<Option<Coordinates>, ValidationError> {
    let lat = fields.get(lat_name).map(|v| v.trim()).filter(|v| !v.is_empty());
    let lng = fields.get(lng_name).map(|v| v.trim()).filter(|v| !v.is_empty());
    match (lat, lng) {
        (None, None) => Ok(None),
        (Some(lat), Some(lng)) => {
            let lat: f64 = lat
                .parse()
                .map_err(|_| ValidationError::new(format!("invalid {} '{}'", lat_name, lat)))?;
            let lng: f64 = lng
                .parse()
                .map_err(|_| ValidationError::new(format!("invalid {} '{}'", lng_name, lng)))?;
            Ok(Some(Coordinates::new(lat, lng)))
        }
        _ => Err(ValidationError::new(format!(
            "{} and {} must be sent together",
            lat_name, lng_name
        ))),
    }
}

fn parse_json_part<T: for<'de> Deserialize<'de>>(
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<Vec<T>, ValidationError> {
    match fields.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| ValidationError::new(format!("invalid {} JSON: {}", name, e))),
    }
}

/// Body of `POST /api/interventions/batch`. Records carry no photos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchBody {
    pub records: Vec<CaptureRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub accepted: usize,
}

/// Body of `POST /api/interventions/{id}/children`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildrenBody {
    #[serde(default)]
    pub crew: Vec<CrewEntry>,
    #[serde(default)]
    pub equipment: Vec<EquipmentUsage>,
}

/// What the ingest handler answers for a single submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub id: i64,
    pub local_id: String,
    /// False when the capture had already been ingested under this local_id
    pub created: bool,
    pub crew_persisted: bool,
    pub equipment_persisted: bool,
}

impl IngestReceipt {
    pub fn children_complete(&self) -> bool {
        self.crew_persisted && self.equipment_persisted
    }
}
