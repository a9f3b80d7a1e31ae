//! Ollama-backed transaction parser.
//!
//! Sends the message to the chat endpoint of a local model server with
//! instructions to reply with one flat JSON object, then runs the reply
//! through `response::interpret`.

use super::{response, ParsedTransaction, ParserError, TransactionParser};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use std::time::{Duration, Instant};
use tracing::instrument;

const SYSTEM_PROMPT: &str = r#"You read bank and payment notifications (SMS or email) and extract at most one financial transaction.
Reply with a single JSON object and nothing else. No markdown, no code fences, no commentary.
Use exactly these keys:
  "amount": the transaction amount as a plain number without currency symbols or grouping,
  "currency": ISO 4217 code, "INR" when the message shows Rs, Rs. or the rupee sign,
  "merchantName": the merchant, payee or payer, or null,
  "category": a short spending category such as FOOD, SHOPPING, TRAVEL, BILLS, TRANSFER, or null,
  "transactionType": "DEBIT" when money left the account, "CREDIT" when money arrived,
  "transactionDate": the date in yyyy-MM-ddTHH:mm:ss form, or null when the message has none,
  "description": a one line summary.
OTPs, promotions, balance alerts and reminders are not transactions. For those reply exactly:
{"transactionType":"NONE","amount":0}"#;

/// Chat-completion client for the model server.
pub struct LlmTransactionParser {
    client: Client,
    chat_url: String,
    model: String,
    timeout: Duration,
}

impl LlmTransactionParser {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            chat_url: format!("{}/api/chat", base_url.trim_end_matches('/')),
            model: model.to_string(),
            timeout,
        })
    }

    async fn complete(&self, text: &str) -> Result<String, ParserError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            stream: false,
            format: "json",
            options: ChatOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .traced_post(&self.chat_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ParserError::Timeout(self.timeout)
                } else {
                    ParserError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ParserError::Api(format!(
                "model server error {}: {}",
                status, error_text
            )));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| ParserError::Api(format!("Failed to parse response: {}", e)))?;

        Ok(reply.message.map(|m| m.content).unwrap_or_default())
    }
}

#[async_trait]
impl TransactionParser for LlmTransactionParser {
    #[instrument(skip(self, text), fields(model = %self.model, text_len = text.len()))]
    async fn parse(&self, text: &str) -> Option<ParsedTransaction> {
        if text.trim().is_empty() {
            return None;
        }

        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.complete(text)).await {
            Ok(Ok(content)) => response::interpret(&content),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ParserError::Timeout(self.timeout)),
        };

        metrics::histogram!("parser_call_duration_seconds").record(start.elapsed().as_secs_f64());

        match result {
            Ok(Some(parsed)) => {
                metrics::counter!("parser_calls_total", "outcome" => "parsed").increment(1);
                tracing::debug!(
                    transaction_type = %parsed.transaction_type,
                    amount = %parsed.amount,
                    "Model reply parsed"
                );
                Some(parsed)
            }
            Ok(None) => {
                metrics::counter!("parser_calls_total", "outcome" => "not_transaction").increment(1);
                tracing::debug!("Model reported no transaction");
                None
            }
            Err(e) => {
                metrics::counter!("parser_calls_total", "outcome" => e.outcome_label()).increment(1);
                tracing::warn!(error = %e, "Transaction parse failed");
                None
            }
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    format: &'a str,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatReply>,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}
