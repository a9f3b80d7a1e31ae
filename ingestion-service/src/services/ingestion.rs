//! Single entry point for every inbound message.
//!
//! Records the raw message exactly once per external id, applies the
//! admission filter and hands admitted messages to the extraction pipeline.

use super::admission::is_admissible;
use super::notifier::{IngestEvent, Notifier};
use super::store::{RawMessageStore, StoreError};
use crate::models::{MessageSource, NewRawMessage, RawMessage};
use crate::workers::DispatchHandle;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// A message as delivered by a channel adapter.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub source: MessageSource,
    pub external_id: Option<String>,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Recorded and queued for extraction.
    Admitted(RawMessage),
    /// Recorded as processed without extraction.
    Filtered(RawMessage),
    /// The external id was already recorded; nothing was written.
    Duplicate { external_id: String },
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Admitted(_) => "admitted",
            IngestOutcome::Filtered(_) => "filtered",
            IngestOutcome::Duplicate { .. } => "duplicate",
        }
    }

    pub fn raw_message_id(&self) -> Option<Uuid> {
        match self {
            IngestOutcome::Admitted(m) | IngestOutcome::Filtered(m) => Some(m.id),
            IngestOutcome::Duplicate { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct IngestionCoordinator {
    raw_messages: Arc<dyn RawMessageStore>,
    dispatcher: DispatchHandle,
    notifier: Notifier,
}

impl IngestionCoordinator {
    pub fn new(
        raw_messages: Arc<dyn RawMessageStore>,
        dispatcher: DispatchHandle,
        notifier: Notifier,
    ) -> Self {
        Self {
            raw_messages,
            dispatcher,
            notifier,
        }
    }

    /// True when `external_id` is recorded and admitted, i.e. needs no
    /// further work from any channel.
    pub async fn is_already_ingested(&self, external_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .raw_messages
            .find_by_external_id(external_id)
            .await?
            .is_some_and(|m| m.admitted))
    }

    #[instrument(skip(self, message), fields(source = %message.source, external_id = ?message.external_id))]
    pub async fn ingest(&self, message: IncomingMessage) -> Result<IngestOutcome, StoreError> {
        let source = message.source;
        let outcome = self.ingest_inner(message).await;

        let label = match &outcome {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        metrics::counter!("ingestion_messages_total", "source" => source.as_str(), "outcome" => label)
            .increment(1);

        outcome
    }

    async fn ingest_inner(&self, message: IncomingMessage) -> Result<IngestOutcome, StoreError> {
        if let Some(external_id) = message.external_id.as_deref() {
            if let Some(existing) = self.raw_messages.find_by_external_id(external_id).await? {
                if existing.admitted {
                    tracing::info!(
                        raw_message_id = %existing.id,
                        "Message already ingested, skipping"
                    );
                    return Ok(IngestOutcome::Duplicate {
                        external_id: external_id.to_string(),
                    });
                }
                return self.complete_admission(existing).await;
            }
        }

        if !is_admissible(&message.body) {
            return self.record_skipped(message).await;
        }

        let pending = NewRawMessage::pending(
            message.source,
            message.external_id.clone(),
            message.sender,
            message.body,
            message.received_at,
        );

        let stored = match self.raw_messages.insert(pending).await {
            Ok(stored) => stored,
            Err(StoreError::UniqueViolation(_)) => {
                // Lost a race with a concurrent ingest of the same message.
                return Ok(IngestOutcome::Duplicate {
                    external_id: message.external_id.unwrap_or_default(),
                });
            }
            Err(e) => return Err(e),
        };

        self.complete_admission(stored).await
    }

    /// Stores a message the admission filter rejected, already processed so
    /// that neither the sweeper nor a later poll looks at it again.
    #[instrument(skip(self, message), fields(source = %message.source, external_id = ?message.external_id))]
    pub async fn record_skipped(
        &self,
        message: IncomingMessage,
    ) -> Result<IngestOutcome, StoreError> {
        let external_id = message.external_id.clone();
        let skipped = NewRawMessage::skipped(
            message.source,
            message.external_id,
            message.sender,
            message.body,
            message.received_at,
        );

        match self.raw_messages.insert(skipped).await {
            Ok(stored) => {
                tracing::info!(raw_message_id = %stored.id, "Message filtered as non-financial");
                Ok(IngestOutcome::Filtered(stored))
            }
            Err(StoreError::UniqueViolation(_)) => Ok(IngestOutcome::Duplicate {
                external_id: external_id.unwrap_or_default(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Second phase of a write: flips `admitted`, triggers extraction and
    /// announces the message. Also resumes records whose first phase
    /// succeeded but whose second phase never ran.
    async fn complete_admission(
        &self,
        mut stored: RawMessage,
    ) -> Result<IngestOutcome, StoreError> {
        if !stored.admitted {
            self.raw_messages.mark_admitted(stored.id).await?;
            stored.admitted = true;
        }

        if !stored.processed && !self.dispatcher.dispatch(stored.id) {
            tracing::warn!(
                raw_message_id = %stored.id,
                "Extraction queue unavailable, message left for the backlog sweeper"
            );
        }

        self.notifier.publish(IngestEvent::RawMessageIngested {
            raw_message_id: stored.id,
            source: stored.source,
            received_at: stored.received_at,
        });

        tracing::info!(raw_message_id = %stored.id, "Message admitted");
        Ok(IngestOutcome::Admitted(stored))
    }
}
