//! Periodic re-drive of messages that never reached a verdict.

use crate::services::store::RawMessageStore;
use crate::workers::transaction_extractor::{ExtractionOutcome, TransactionExtractor};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub created: usize,
    pub deduplicated: usize,
    pub no_match: usize,
    pub rejected: usize,
    pub failed: usize,
}

pub struct BacklogSweeper {
    raw_messages: Arc<dyn RawMessageStore>,
    extractor: Arc<TransactionExtractor>,
    interval: Duration,
}

impl BacklogSweeper {
    pub fn new(
        raw_messages: Arc<dyn RawMessageStore>,
        extractor: Arc<TransactionExtractor>,
        interval: Duration,
    ) -> Self {
        Self {
            raw_messages,
            extractor,
            interval,
        }
    }

    /// Runs the transaction extractor over every unprocessed message.
    /// A failure on one message is logged and the sweep moves on.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let pending = match self.raw_messages.find_unprocessed().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load backlog");
                return report;
            }
        };

        if pending.is_empty() {
            return report;
        }
        tracing::info!(count = pending.len(), "Sweeping unprocessed messages");

        for message in &pending {
            report.examined += 1;
            metrics::counter!("backlog_sweep_messages_total").increment(1);

            match self.extractor.extract_one(message).await {
                Ok(ExtractionOutcome::Created(_)) => report.created += 1,
                Ok(ExtractionOutcome::Deduplicated { .. }) => report.deduplicated += 1,
                Ok(ExtractionOutcome::NoMatch) => report.no_match += 1,
                Ok(ExtractionOutcome::Rejected) => report.rejected += 1,
                Ok(ExtractionOutcome::AlreadyProcessed) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(raw_message_id = %message.id, error = %e, "Backlog item failed");
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            created = report.created,
            deduplicated = report.deduplicated,
            no_match = report.no_match,
            rejected = report.rejected,
            failed = report.failed,
            "Backlog sweep finished"
        );
        report
    }

    /// Sweeps on a fixed interval until cancelled. Ticks never overlap; a
    /// tick missed while a sweep runs is skipped.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(interval_secs = self.interval.as_secs(), "Backlog sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Backlog sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }
}
