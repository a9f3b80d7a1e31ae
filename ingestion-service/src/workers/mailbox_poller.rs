//! Periodic intake of email from the remote mailbox.
//!
//! Each tick searches for messages newer than the watermark, feeds unseen ones
//! through the coordinator and then moves the watermark to the tick start
//! minus a fixed overlap, so that messages indexed late are searched again.

use crate::config::MailboxConfig;
use crate::models::MessageSource;
use crate::services::admission::is_admissible;
use crate::services::ingestion::{IncomingMessage, IngestOutcome, IngestionCoordinator};
use crate::services::mailbox::{mime, Mailbox, MailboxError};
use crate::services::store::StoreError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Error, Debug)]
enum CandidateError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub candidates: usize,
    pub ingested: usize,
    pub skipped: usize,
    pub already_seen: usize,
    pub failed: usize,
}

/// Search expression: `after:<epoch secs>` plus the keyword disjunction.
pub fn build_query(after_epoch_secs: i64, keywords: &[String]) -> String {
    if keywords.is_empty() {
        return format!("after:{}", after_epoch_secs);
    }
    let terms = keywords
        .iter()
        .map(|k| format!("\"{}\"", k))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("after:{} ({})", after_epoch_secs, terms)
}

pub struct MailboxPoller {
    mailbox: Arc<dyn Mailbox>,
    coordinator: IngestionCoordinator,
    config: MailboxConfig,
    watermark: DateTime<Utc>,
}

impl MailboxPoller {
    /// Starts with the watermark `initial_lookback_minutes` before `now`.
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        coordinator: IngestionCoordinator,
        config: MailboxConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let watermark = now - Duration::minutes(config.initial_lookback_minutes);
        Self {
            mailbox,
            coordinator,
            config,
            watermark,
        }
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub async fn tick(&mut self) -> Result<PollReport, MailboxError> {
        self.tick_at(Utc::now()).await
    }

    /// One poll cycle that started at `started_at`.
    ///
    /// A failed search leaves the watermark untouched. Failures on single
    /// candidates are counted and do not stop the tick.
    #[instrument(skip(self), fields(watermark = %self.watermark))]
    pub async fn tick_at(&mut self, started_at: DateTime<Utc>) -> Result<PollReport, MailboxError> {
        let query = build_query(self.watermark.timestamp(), &self.config.search_keywords);

        let ids = match self
            .mailbox
            .search(&query, &self.config.label, self.config.max_results)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                metrics::counter!("mailbox_poll_ticks_total", "outcome" => "search_failed")
                    .increment(1);
                tracing::error!(error = %e, "Mailbox search failed");
                return Err(e);
            }
        };

        let mut report = PollReport {
            candidates: ids.len(),
            ..Default::default()
        };

        for id in &ids {
            match self.process_candidate(id, started_at).await {
                Ok(Some(IngestOutcome::Admitted(_))) => report.ingested += 1,
                Ok(Some(IngestOutcome::Filtered(_))) => report.skipped += 1,
                Ok(Some(IngestOutcome::Duplicate { .. })) | Ok(None) => report.already_seen += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(message_id = %id, error = %e, "Failed to process mailbox message");
                }
            }
        }

        let next = started_at - Duration::seconds(self.config.overlap_secs);
        if next > self.watermark {
            self.watermark = next;
        }

        metrics::counter!("mailbox_poll_ticks_total", "outcome" => "ok").increment(1);
        tracing::info!(
            candidates = report.candidates,
            ingested = report.ingested,
            skipped = report.skipped,
            already_seen = report.already_seen,
            failed = report.failed,
            watermark = %self.watermark,
            "Mailbox poll finished"
        );
        Ok(report)
    }

    /// `Ok(None)` means the message was recorded before and was not fetched.
    async fn process_candidate(
        &self,
        id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Option<IngestOutcome>, CandidateError> {
        if self.coordinator.is_already_ingested(id).await? {
            return Ok(None);
        }

        let message = self.mailbox.fetch(id).await?;
        let subject = message.payload.header("Subject");
        let sender = message
            .payload
            .header("From")
            .unwrap_or("unknown")
            .to_string();
        let body = mime::composite_body(subject, &mime::extract_body(&message.payload));
        let received_at = message
            .internal_date_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(started_at);

        let incoming = IncomingMessage {
            source: MessageSource::Email,
            external_id: Some(message.id.clone()),
            sender,
            body,
            received_at,
        };

        let outcome = if is_admissible(&incoming.body) {
            self.coordinator.ingest(incoming).await?
        } else {
            self.coordinator.record_skipped(incoming).await?
        };
        Ok(Some(outcome))
    }

    /// Polls on a fixed interval until cancelled. The watermark lives only in
    /// this task; a restart falls back to the initial lookback.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.config.poll_interval_secs,
            watermark = %self.watermark,
            "Mailbox poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Mailbox poller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    // Errors are logged inside the tick; the next tick retries.
                    let _ = self.tick().await;
                }
            }
        }
    }
}
