//! HTTP transport to the remote ingest endpoint.

use image::imageops::FilterType;
use image::GenericImageView;
use log::{debug, error, info, warn};
use reqwest::multipart::{Form, Part};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{CaptureRecord, Coordinates, PhotoAttachment};
use crate::submission::{
    form_fields, photo_part_name, BatchBody, BatchReceipt, ChildrenBody, IngestReceipt,
};
use crate::sync::UploadError;

/// Re-encoding applied to photos before upload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhotoEncoding {
    /// Longest edge in pixels; larger photos are scaled down
    pub max_dimension: u32,
    /// JPEG quality, 1-100
    pub jpeg_quality: u8,
}

/// Supplies the device position at the moment a capture is sent
pub type PositionSource = Arc<dyn Fn() -> Option<Coordinates> + Send + Sync>;

/// Outcome of a delivered submission
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub id: i64,
    /// False when the remote already held this capture
    pub created: bool,
    /// Both child collections are known to be stored remotely
    pub children_complete: bool,
}

#[derive(Clone)]
pub struct IngestClient {
    http: reqwest::Client,
    base_url: String,
    photo_encoding: Option<PhotoEncoding>,
    position_source: Option<PositionSource>,
}

impl IngestClient {
    pub fn new(remote_url: &str, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: remote_url.trim_end_matches('/').to_string(),
            photo_encoding: None,
            position_source: None,
        })
    }

    pub fn with_photo_encoding(mut self, encoding: PhotoEncoding) -> Self {
        self.photo_encoding = Some(encoding);
        self
    }

    pub fn with_position_source(mut self, source: PositionSource) -> Self {
        self.position_source = Some(source);
        self
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    /// Send one capture with its photos and child collections
    pub async fn submit(&self, record: &CaptureRecord) -> Result<SubmitReceipt, UploadError> {
        let record = self.prepare(record);

        let fields = form_fields(&record)
            .map_err(|e| UploadError::Encoding(format!("Failed to encode capture: {}", e)))?;
        let mut form = Form::new();
        for (name, value) in fields {
            form = form.text(name, value);
        }
        for photo in &record.photos {
            form = form.part(photo_part_name(photo.slot), self.photo_part(photo)?);
        }

        let url = format!("{}/api/interventions", self.base_url);
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Connectivity(format!("Network error posting capture: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UploadError::Connectivity(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: Some(status.as_u16()),
                message: error_message(&body),
            });
        }

        let receipt: IngestReceipt =
            serde_json::from_str(&body).map_err(|e| UploadError::Rejected {
                status: Some(status.as_u16()),
                message: format!("Response did not confirm creation: {}", e),
            })?;
        if receipt.local_id != record.local_id {
            return Err(UploadError::Rejected {
                status: Some(status.as_u16()),
                message: format!(
                    "Response confirmed {} instead of {}",
                    receipt.local_id, record.local_id
                ),
            });
        }

        let mut children_complete = receipt.children_complete();
        if !children_complete {
            warn!(
                "Intervention {} stored without all child records (crew: {}, equipment: {}), retrying attach",
                receipt.id, receipt.crew_persisted, receipt.equipment_persisted
            );
            match self.attach_children(receipt.id, &record).await {
                Ok(()) => children_complete = true,
                Err(e) => error!(
                    "Failed to attach child records to intervention {}: {}",
                    receipt.id, e
                ),
            }
        }

        debug!(
            "Capture {} stored as intervention {} (created: {})",
            record.local_id, receipt.id, receipt.created
        );
        Ok(SubmitReceipt {
            id: receipt.id,
            created: receipt.created,
            children_complete,
        })
    }

    /// Send several photo-less captures in one request. Returns how many the
    /// remote accepted.
    pub async fn submit_batch(&self, records: &[CaptureRecord]) -> Result<usize, UploadError> {
        let body = BatchBody {
            records: records.iter().map(|r| self.prepare(r)).collect(),
        };

        let url = format!("{}/api/interventions/batch", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| UploadError::Connectivity(format!("Network error posting batch: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UploadError::Connectivity(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: Some(status.as_u16()),
                message: error_message(&text),
            });
        }

        let receipt: BatchReceipt =
            serde_json::from_str(&text).map_err(|e| UploadError::Rejected {
                status: Some(status.as_u16()),
                message: format!("Response did not confirm the batch: {}", e),
            })?;
        if receipt.accepted < records.len() {
            warn!(
                "Remote accepted {} of {} batched captures, the rest were invalid",
                receipt.accepted,
                records.len()
            );
        } else {
            info!("Remote accepted batch of {}", receipt.accepted);
        }
        Ok(receipt.accepted)
    }

    /// Idempotent follow-up for child collections the primary request missed
    async fn attach_children(&self, id: i64, record: &CaptureRecord) -> Result<(), String> {
        let body = ChildrenBody {
            crew: record.transmittable_crew(),
            equipment: record.transmittable_equipment(),
        };
        let url = format!("{}/api/interventions/{}/children", self.base_url, id);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Network error attaching children: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {}: {}", status, error_message(&text)));
        }
        Ok(())
    }

    /// Copy of `record` as it should be transmitted
    fn prepare(&self, record: &CaptureRecord) -> CaptureRecord {
        let mut record = record.clone();
        record.crew = record.transmittable_crew();
        record.equipment = record.transmittable_equipment();
        if record.geo.at_submission.is_none() {
            if let Some(source) = &self.position_source {
                record.geo.at_submission = source();
            }
        }
        record
    }

    fn photo_part(&self, photo: &PhotoAttachment) -> Result<Part, UploadError> {
        let (data, content_type) = match &self.photo_encoding {
            Some(encoding) => match reencode_photo(&photo.data, encoding) {
                Ok(jpeg) => (jpeg, "image/jpeg".to_string()),
                Err(e) => {
                    warn!(
                        "Could not re-encode '{}' photo, sending original: {}",
                        photo.slot, e
                    );
                    (photo.data.clone(), photo.content_type.clone())
                }
            },
            None => (photo.data.clone(), photo.content_type.clone()),
        };

        let extension = if content_type == "image/png" { "png" } else { "jpg" };
        Part::bytes(data)
            .file_name(format!("{}.{}", photo.slot, extension))
            .mime_str(&content_type)
            .map_err(|e| {
                UploadError::Encoding(format!(
                    "Invalid content type '{}' on '{}' photo: {}",
                    content_type, photo.slot, e
                ))
            })
    }
}

/// Scale the photo down to fit `max_dimension` and re-encode as JPEG
pub fn reencode_photo(data: &[u8], encoding: &PhotoEncoding) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(data)?;
    let (w, h) = img.dimensions();
    let max = encoding.max_dimension.max(1);
    let img = if w > max || h > max {
        img.resize(max, max, FilterType::Triangle)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let quality = encoding.jpeg_quality.clamp(1, 100);
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ColorType::Rgb8)?;
    Ok(out)
}

/// `error` field of a JSON error body, or the raw body
fn error_message(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match value.get("error").and_then(|e| e.as_str()) {
            Some(msg) => msg.to_string(),
            None => body.to_string(),
        },
        Err(_) => body.chars().take(200).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, Rgb};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let buffer = ImageBuffer::from_pixel(width, height, Rgb([200u8, 10, 10]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(buffer)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_reencode_scales_down_and_outputs_jpeg() {
        let encoding = PhotoEncoding {
            max_dimension: 16,
            jpeg_quality: 70,
        };
        let jpeg = reencode_photo(&png_bytes(64, 32), &encoding).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }

    #[test]
    fn test_reencode_keeps_small_photos_size() {
        let encoding = PhotoEncoding {
            max_dimension: 1024,
            jpeg_quality: 80,
        };
        let jpeg = reencode_photo(&png_bytes(10, 12), &encoding).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (10, 12));
    }

    #[test]
    fn test_reencode_rejects_garbage() {
        let encoding = PhotoEncoding {
            max_dimension: 100,
            jpeg_quality: 80,
        };
        assert!(reencode_photo(&[1, 2, 3, 4], &encoding).is_err());
    }

    #[tokio::test]
    async fn test_bad_photo_content_type_fails_locally() {
        // nothing listens on port 9; the failure must come before any request
        let client = IngestClient::new("http://127.0.0.1:9/", Duration::from_secs(1)).unwrap();
        let mut record = CaptureRecord::new(
            "LOC-1",
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        record.set_photo(
            crate::capture::PhotoSlot::Overview,
            "not a mime type",
            vec![1, 2, 3],
        );

        match client.submit(&record).await {
            Err(UploadError::Encoding(msg)) => assert!(msg.contains("not a mime type")),
            other => panic!("expected a local encoding failure, got {:?}", other.map(|r| r.id)),
        }
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(r#"{"error":"bad date"}"#), "bad date");
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_prepare_fills_position_and_filters_children() {
        let client = IngestClient::new("http://127.0.0.1:9/", Duration::from_secs(1))
            .unwrap()
            .with_position_source(Arc::new(|| Some(Coordinates::new(1.5, 2.5))));
        assert_eq!(client.health_url(), "http://127.0.0.1:9/health");

        let mut record = CaptureRecord::new(
            "LOC-1",
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        record.equipment = vec![crate::capture::EquipmentUsage {
            item: "X".into(),
            hours: 0.0,
        }];
        let prepared = client.prepare(&record);
        assert_eq!(prepared.geo.at_submission, Some(Coordinates::new(1.5, 2.5)));
        assert!(prepared.equipment.is_empty());
    }
}
