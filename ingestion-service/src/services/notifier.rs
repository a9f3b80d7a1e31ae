//! In-process event fan-out.
//!
//! Publishing never blocks and never fails the caller: events sent with no
//! subscriber attached are dropped.

use crate::models::{MessageSource, TransactionType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    RawMessageIngested {
        raw_message_id: Uuid,
        source: MessageSource,
        received_at: DateTime<Utc>,
    },
    TransactionCreated {
        transaction_id: Uuid,
        raw_message_id: Uuid,
        amount: Decimal,
        currency: String,
        transaction_type: TransactionType,
    },
}

impl IngestEvent {
    fn kind(&self) -> &'static str {
        match self {
            IngestEvent::RawMessageIngested { .. } => "raw_message_ingested",
            IngestEvent::TransactionCreated { .. } => "transaction_created",
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<IngestEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: IngestEvent) {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => tracing::debug!(event = kind, receivers, "Event published"),
            Err(_) => tracing::trace!(event = kind, "No subscribers, event dropped"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
