//! Capture Record: one field intervention waiting to reach the central store.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::generate_local_id;

/// Named slot a photograph is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoSlot {
    Overview,
    Start,
    InProgress,
    End,
}

impl PhotoSlot {
    pub const ALL: [PhotoSlot; 4] = [
        PhotoSlot::Overview,
        PhotoSlot::Start,
        PhotoSlot::InProgress,
        PhotoSlot::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoSlot::Overview => "overview",
            PhotoSlot::Start => "start",
            PhotoSlot::InProgress => "in_progress",
            PhotoSlot::End => "end",
        }
    }
}

impl fmt::Display for PhotoSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhotoSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "overview" => Ok(PhotoSlot::Overview),
            "start" => Ok(PhotoSlot::Start),
            "in_progress" | "in-progress" => Ok(PhotoSlot::InProgress),
            "end" => Ok(PhotoSlot::End),
            other => Err(format!(
                "Unknown photo slot '{}', expected one of: overview, start, in_progress, end",
                other
            )),
        }
    }
}

/// Binary photograph bound to a slot. Raw bytes live inside the record.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoAttachment {
    pub slot: PhotoSlot,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Device-observed coordinates, used for audit only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoFields {
    /// Observed by the device at capture time
    pub captured: Option<Coordinates>,
    /// Corrected by the user on the map
    pub corrected: Option<Coordinates>,
    /// Observed again when the record is sent
    pub at_submission: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewEntry {
    pub crew_type: String,
    pub count: u32,
    pub hours: f64,
}

impl CrewEntry {
    /// An entry with neither members nor hours carries no information
    pub fn has_usage(&self) -> bool {
        self.count > 0 || self.hours > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentUsage {
    /// Reference to an equipment or vehicle item
    pub item: String,
    pub hours: f64,
}

impl EquipmentUsage {
    pub fn has_usage(&self) -> bool {
        self.hours > 0.0
    }
}

/// One pending intervention.
///
/// Photos are not part of the serde representation: the local store keeps
/// them in their own table and the batch path never carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub local_id: String,
    pub location_code: String,
    #[serde(default)]
    pub district_code: Option<String>,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub street_address: Option<String>,
    #[serde(default)]
    pub landmark: Option<String>,
    #[serde(default)]
    pub work_order: Option<String>,
    #[serde(default)]
    pub units_completed: u32,
    #[serde(default)]
    pub households_reached: u32,
    pub performed_on: NaiveDate,
    #[serde(default)]
    pub started_at: Option<NaiveTime>,
    #[serde(default)]
    pub finished_at: Option<NaiveTime>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub geo: GeoFields,
    #[serde(skip)]
    pub photos: Vec<PhotoAttachment>,
    #[serde(default)]
    pub crew: Vec<CrewEntry>,
    #[serde(default)]
    pub equipment: Vec<EquipmentUsage>,
    /// Always false while queued; a delivered record is removed, not flagged
    #[serde(default)]
    pub is_synced: bool,
    pub local_created_at: DateTime<Utc>,
}

impl CaptureRecord {
    /// Create a record with a fresh `local_id`, stamped with the current time
    pub fn new(location_code: impl Into<String>, performed_on: NaiveDate) -> Self {
        Self {
            local_id: generate_local_id(),
            location_code: location_code.into(),
            district_code: None,
            site_name: None,
            street_address: None,
            landmark: None,
            work_order: None,
            units_completed: 0,
            households_reached: 0,
            performed_on,
            started_at: None,
            finished_at: None,
            notes: None,
            geo: GeoFields::default(),
            photos: Vec::new(),
            crew: Vec::new(),
            equipment: Vec::new(),
            is_synced: false,
            local_created_at: Utc::now(),
        }
    }

    /// Attach a photo, replacing any photo already bound to the slot
    pub fn set_photo(&mut self, slot: PhotoSlot, content_type: impl Into<String>, data: Vec<u8>) {
        self.photos.retain(|p| p.slot != slot);
        self.photos.push(PhotoAttachment {
            slot,
            content_type: content_type.into(),
            data,
        });
        self.photos.sort_by_key(|p| p.slot);
    }

    pub fn has_attachments(&self) -> bool {
        !self.photos.is_empty()
    }

    /// Crew entries worth sending (zero-usage entries dropped)
    pub fn transmittable_crew(&self) -> Vec<CrewEntry> {
        self.crew.iter().filter(|c| c.has_usage()).cloned().collect()
    }

    /// Equipment entries worth sending (entries with zero hours dropped)
    pub fn transmittable_equipment(&self) -> Vec<EquipmentUsage> {
        self.equipment
            .iter()
            .filter(|e| e.has_usage())
            .cloned()
            .collect()
    }

    /// Check the rules the ingest endpoint enforces.
    ///
    /// A record failing here is rejected by the server and never retried.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.local_id.trim().is_empty() {
            return Err(ValidationError::new("local_id is required"));
        }
        if self.location_code.trim().is_empty() {
            return Err(ValidationError::new("location_code is required"));
        }

        for (name, coords) in [
            ("captured", &self.geo.captured),
            ("corrected", &self.geo.corrected),
            ("at_submission", &self.geo.at_submission),
        ] {
            if let Some(c) = coords {
                if !c.is_valid() {
                    return Err(ValidationError::new(format!(
                        "{} coordinates out of range: ({}, {})",
                        name, c.lat, c.lng
                    )));
                }
            }
        }

        if let (Some(start), Some(end)) = (self.started_at, self.finished_at) {
            if end < start {
                return Err(ValidationError::new(format!(
                    "finished_at {} is before started_at {}",
                    end, start
                )));
            }
        }

        for entry in &self.crew {
            if entry.crew_type.trim().is_empty() {
                return Err(ValidationError::new("crew entry without a type"));
            }
            if !entry.hours.is_finite() || entry.hours < 0.0 {
                return Err(ValidationError::new(format!(
                    "crew entry '{}' has invalid hours {}",
                    entry.crew_type, entry.hours
                )));
            }
        }

        for entry in &self.equipment {
            if entry.item.trim().is_empty() {
                return Err(ValidationError::new("equipment entry without an item"));
            }
            if !entry.hours.is_finite() || entry.hours < 0.0 {
                return Err(ValidationError::new(format!(
                    "equipment entry '{}' has invalid hours {}",
                    entry.item, entry.hours
                )));
            }
        }

        let mut seen = Vec::with_capacity(self.photos.len());
        for photo in &self.photos {
            if seen.contains(&photo.slot) {
                return Err(ValidationError::new(format!(
                    "duplicate photo for slot '{}'",
                    photo.slot
                )));
            }
            if photo.data.is_empty() {
                return Err(ValidationError::new(format!(
                    "photo for slot '{}' is empty",
                    photo.slot
                )));
            }
            seen.push(photo.slot);
        }

        Ok(())
    }
}

/// Payload rejected as malformed
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid capture: {}", self.message)
    }
}

impl std::error::Error for ValidationError {}
