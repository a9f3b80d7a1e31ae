//! Turns an admitted raw message into at most one deduplicated transaction.

use crate::models::{dedupe_key, dedupe_window, NewTransaction, RawMessage, Transaction};
use crate::services::notifier::{IngestEvent, Notifier};
use crate::services::parser::TransactionParser;
use crate::services::store::{RawMessageStore, StoreError, TransactionStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Created(Transaction),
    /// An equivalent transaction already exists within the dedupe window.
    Deduplicated { dedupe_key: String },
    /// The parser found nothing; the message is terminal anyway.
    NoMatch,
    /// The store refused the extracted values; the message is terminal.
    Rejected,
    /// The message was processed before this run.
    AlreadyProcessed,
}

impl ExtractionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExtractionOutcome::Created(_) => "created",
            ExtractionOutcome::Deduplicated { .. } => "deduplicated",
            ExtractionOutcome::NoMatch => "no_match",
            ExtractionOutcome::Rejected => "rejected",
            ExtractionOutcome::AlreadyProcessed => "already_processed",
        }
    }
}

pub struct TransactionExtractor {
    parser: Arc<dyn TransactionParser>,
    raw_messages: Arc<dyn RawMessageStore>,
    transactions: Arc<dyn TransactionStore>,
    notifier: Notifier,
    default_currency: String,
}

impl TransactionExtractor {
    pub fn new(
        parser: Arc<dyn TransactionParser>,
        raw_messages: Arc<dyn RawMessageStore>,
        transactions: Arc<dyn TransactionStore>,
        notifier: Notifier,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            parser,
            raw_messages,
            transactions,
            notifier,
            default_currency: default_currency.into(),
        }
    }

    /// Extracts from `message`, marking it processed on every path that
    /// reaches a verdict. A store failure leaves it unprocessed for the
    /// backlog sweeper.
    #[instrument(skip(self, message), fields(raw_message_id = %message.id, source = %message.source))]
    pub async fn extract_one(&self, message: &RawMessage) -> Result<ExtractionOutcome, StoreError> {
        let outcome = self.extract_inner(message).await;

        let label = match &outcome {
            Ok(o) => o.label(),
            Err(_) => "error",
        };
        metrics::counter!("transactions_extracted_total", "outcome" => label).increment(1);

        outcome
    }

    async fn extract_inner(&self, message: &RawMessage) -> Result<ExtractionOutcome, StoreError> {
        if message.processed {
            return Ok(ExtractionOutcome::AlreadyProcessed);
        }

        let Some(parsed) = self.parser.parse(&message.body).await else {
            self.raw_messages.mark_processed(message.id, Utc::now()).await?;
            tracing::info!("No transaction found in message");
            return Ok(ExtractionOutcome::NoMatch);
        };

        let currency = parsed
            .currency
            .clone()
            .unwrap_or_else(|| self.default_currency.clone());
        let transaction_date = parsed.transaction_date.unwrap_or(message.received_at);
        let key = dedupe_key(
            parsed.amount,
            &currency,
            parsed.transaction_type,
            transaction_date,
            parsed.merchant_name.as_deref(),
        );

        let (window_start, window_end) = dedupe_window(transaction_date);
        if self
            .transactions
            .exists_by_dedupe_key_between(&key, window_start, window_end)
            .await?
        {
            self.raw_messages.mark_processed(message.id, Utc::now()).await?;
            tracing::info!(dedupe_key = %key, "Equivalent transaction already recorded");
            return Ok(ExtractionOutcome::Deduplicated { dedupe_key: key });
        }

        let new_transaction = NewTransaction {
            raw_message_id: message.id,
            amount: parsed.amount,
            currency,
            merchant_name: parsed.merchant_name,
            category: parsed.category,
            transaction_type: parsed.transaction_type,
            transaction_date,
            description: parsed.description,
            dedupe_key: key.clone(),
        };

        let transaction = match self.transactions.insert(new_transaction).await {
            Ok(t) => t,
            Err(StoreError::UniqueViolation(_)) => {
                // A concurrent run for this message or for a copy of the same
                // event got there first.
                self.raw_messages.mark_processed(message.id, Utc::now()).await?;
                tracing::info!(dedupe_key = %key, "Equivalent transaction recorded concurrently");
                return Ok(ExtractionOutcome::Deduplicated { dedupe_key: key });
            }
            Err(StoreError::Rejected(reason)) => {
                self.raw_messages.mark_processed(message.id, Utc::now()).await?;
                tracing::warn!(%reason, "Extracted transaction rejected by store");
                return Ok(ExtractionOutcome::Rejected);
            }
            Err(e) => return Err(e),
        };

        self.raw_messages.mark_processed(message.id, Utc::now()).await?;

        self.notifier.publish(IngestEvent::TransactionCreated {
            transaction_id: transaction.id,
            raw_message_id: message.id,
            amount: transaction.amount,
            currency: transaction.currency.clone(),
            transaction_type: transaction.transaction_type,
        });

        tracing::info!(
            transaction_id = %transaction.id,
            amount = %transaction.amount,
            transaction_type = %transaction.transaction_type,
            "Transaction recorded"
        );
        Ok(ExtractionOutcome::Created(transaction))
    }
}
