use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// SMS pushed by the device bridge.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    #[validate(custom(function = "not_blank", message = "Sender is required"))]
    pub sender: String,
    #[serde(default)]
    #[validate(custom(function = "not_blank", message = "Body is required"))]
    pub body: String,
    pub received_at: Option<String>,
    pub device_id: Option<String>,
}

impl IngestRequest {
    /// Device timestamp, or now when absent or unreadable.
    pub fn received_at_or_now(&self) -> DateTime<Utc> {
        self.received_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(|| {
                if let Some(raw) = &self.received_at {
                    tracing::warn!(received_at = %raw, "Unreadable receivedAt, using current time");
                }
                Utc::now()
            })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion_id: Option<Uuid>,
    pub message: String,
}
