use super::{ParsedTransaction, TransactionParser};
use async_trait::async_trait;

/// Parser used when no model backend is configured.
pub struct DisabledTransactionParser;

#[async_trait]
impl TransactionParser for DisabledTransactionParser {
    async fn parse(&self, _text: &str) -> Option<ParsedTransaction> {
        metrics::counter!("parser_calls_total", "outcome" => "disabled").increment(1);
        None
    }
}
