//! Metrics collection and Prometheus export.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder. Later calls are no-ops.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");
        describe();
        handle
    });
}

fn describe() {
    metrics::describe_counter!(
        "ingestion_messages_total",
        "Inbound messages by source and outcome"
    );
    metrics::describe_counter!(
        "transactions_extracted_total",
        "Transaction extraction attempts by outcome"
    );
    metrics::describe_counter!(
        "holdings_ledger_entries_total",
        "Investment ledger entries written by entry type"
    );
    metrics::describe_counter!("mailbox_poll_ticks_total", "Mailbox poll ticks by outcome");
    metrics::describe_counter!(
        "backlog_sweep_messages_total",
        "Unprocessed messages re-driven by the backlog sweeper"
    );
    metrics::describe_counter!("parser_calls_total", "Transaction parser calls by outcome");
    metrics::describe_histogram!(
        "parser_call_duration_seconds",
        "Latency of model parser calls"
    );
}

/// Current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}
