//! Transaction parsing capability.
//!
//! The extractor only sees the `TransactionParser` trait. The production
//! implementation asks a local language model; the disabled implementation
//! makes every message a no-match.

pub mod disabled;
pub mod llm;
pub mod response;

pub use disabled::DisabledTransactionParser;
pub use llm::LlmTransactionParser;

use crate::config::ParserConfig;
use crate::models::TransactionType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for parser backends. Never escapes `TransactionParser::parse`.
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model returned an empty reply")]
    EmptyResponse,

    #[error("Malformed model reply: {0}")]
    MalformedResponse(String),
}

impl ParserError {
    pub fn outcome_label(&self) -> &'static str {
        match self {
            ParserError::Network(_) => "network_error",
            ParserError::Api(_) => "api_error",
            ParserError::Timeout(_) => "timeout",
            ParserError::EmptyResponse => "empty",
            ParserError::MalformedResponse(_) => "malformed",
        }
    }
}

/// Structured reading of a message. Amount is always positive.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTransaction {
    pub amount: Decimal,
    pub currency: Option<String>,
    pub merchant_name: Option<String>,
    pub category: Option<String>,
    pub transaction_type: TransactionType,
    pub transaction_date: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

#[async_trait]
pub trait TransactionParser: Send + Sync {
    /// `None` covers "not a transaction" as well as every backend failure.
    async fn parse(&self, text: &str) -> Option<ParsedTransaction>;
}

pub fn build_parser(config: &ParserConfig) -> Result<Arc<dyn TransactionParser>, AppError> {
    if !config.enabled {
        tracing::info!("Transaction parser disabled by configuration");
        return Ok(Arc::new(DisabledTransactionParser));
    }

    tracing::info!(
        base_url = %config.base_url,
        model = %config.model,
        timeout_secs = config.timeout_secs,
        "Using language model transaction parser"
    );
    Ok(Arc::new(LlmTransactionParser::new(
        &config.base_url,
        &config.model,
        config.timeout(),
    )?))
}
