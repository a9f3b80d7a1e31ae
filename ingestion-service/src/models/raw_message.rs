//! Raw inbound message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageSource {
    Sms,
    Email,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::Sms => "SMS",
            MessageSource::Email => "EMAIL",
        }
    }
}

impl std::fmt::Display for MessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SMS" => Ok(MessageSource::Sms),
            "EMAIL" => Ok(MessageSource::Email),
            _ => Err(format!("Unknown message source: {}", s)),
        }
    }
}

/// A message as it was received, before any interpretation.
///
/// `admitted` is set once the coordinator has finished recording the message.
/// Records written by the admission filter are admitted and processed at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: Uuid,
    pub source: MessageSource,
    pub external_id: Option<String>,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub admitted: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for recording a new raw message.
#[derive(Debug, Clone)]
pub struct NewRawMessage {
    pub source: MessageSource,
    pub external_id: Option<String>,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub admitted: bool,
}

impl NewRawMessage {
    /// A message awaiting extraction.
    pub fn pending(
        source: MessageSource,
        external_id: Option<String>,
        sender: String,
        body: String,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            external_id,
            sender,
            body,
            received_at,
            processed: false,
            admitted: false,
        }
    }

    /// A message the admission filter rejected: terminal from the start.
    pub fn skipped(
        source: MessageSource,
        external_id: Option<String>,
        sender: String,
        body: String,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            external_id,
            sender,
            body,
            received_at,
            processed: true,
            admitted: true,
        }
    }

    pub fn into_message(self, id: Uuid, now: DateTime<Utc>) -> RawMessage {
        RawMessage {
            id,
            source: self.source,
            external_id: self.external_id,
            sender: self.sender,
            body: self.body,
            received_at: self.received_at,
            processed: self.processed,
            processed_at: self.processed.then_some(now),
            admitted: self.admitted,
            created_at: now,
        }
    }
}
