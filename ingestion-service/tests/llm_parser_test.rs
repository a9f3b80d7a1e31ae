//! Model-backed parser tests against a mock model server.

use chrono::{TimeZone, Utc};
use ingestion_service::models::TransactionType;
use ingestion_service::services::parser::{LlmTransactionParser, TransactionParser};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SMS: &str = "Rs.1,250.50 debited from A/c XX1234 on 05-03-26 to SWIGGY via UPI";

fn chat_reply(content: &str) -> serde_json::Value {
    json!({
        "model": "llama3.2",
        "message": { "role": "assistant", "content": content },
        "done": true
    })
}

async fn parser_for(server: &MockServer, timeout: Duration) -> LlmTransactionParser {
    LlmTransactionParser::new(&server.uri(), "llama3.2", timeout).expect("Failed to build parser")
}

#[tokio::test]
async fn fenced_reply_is_parsed() {
    let server = MockServer::start().await;
    let content = "Here you go:\n```json\n{\"amount\": \"1,250.50\", \"currency\": \"inr\", \"merchantName\": \"Swiggy\", \"category\": \"FOOD\", \"transactionType\": \"debit\", \"transactionDate\": \"2026-03-05T13:45:00\", \"description\": \"UPI payment to Swiggy\"}\n```";

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({ "model": "llama3.2", "stream": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply(content)))
        .expect(1)
        .mount(&server)
        .await;

    let parser = parser_for(&server, Duration::from_secs(5)).await;
    let parsed = parser.parse(SMS).await.expect("Reply should parse");

    assert_eq!(parsed.amount, Decimal::from_str("1250.50").unwrap());
    assert_eq!(parsed.currency.as_deref(), Some("INR"));
    assert_eq!(parsed.merchant_name.as_deref(), Some("Swiggy"));
    assert_eq!(parsed.transaction_type, TransactionType::Debit);
    assert_eq!(
        parsed.transaction_date,
        Some(Utc.with_ymd_and_hms(2026, 3, 5, 13, 45, 0).unwrap())
    );
}

#[tokio::test]
async fn none_reply_is_not_a_transaction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_reply("{\"transactionType\":\"NONE\",\"amount\":0}")),
        )
        .mount(&server)
        .await;

    let parser = parser_for(&server, Duration::from_secs(5)).await;
    assert!(parser.parse("Your OTP is 482913. Do not share it.").await.is_none());
}

#[tokio::test]
async fn nested_reply_is_rejected() {
    let server = MockServer::start().await;
    let content = "{\"amount\": 100, \"transactionType\": \"CREDIT\", \"merchant\": {\"name\": \"ACME\"}}";
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply(content)))
        .mount(&server)
        .await;

    let parser = parser_for(&server, Duration::from_secs(5)).await;
    assert!(parser.parse(SMS).await.is_none());
}

#[tokio::test]
async fn server_error_is_absorbed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .mount(&server)
        .await;

    let parser = parser_for(&server, Duration::from_secs(5)).await;
    assert!(parser.parse(SMS).await.is_none());
}

#[tokio::test]
async fn slow_model_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_reply("{\"amount\": 10, \"transactionType\": \"DEBIT\"}"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let parser = parser_for(&server, Duration::from_millis(200)).await;
    let started = std::time::Instant::now();
    assert!(parser.parse(SMS).await.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn unreachable_server_is_absorbed() {
    let parser = LlmTransactionParser::new("http://127.0.0.1:1", "llama3.2", Duration::from_secs(2))
        .expect("Failed to build parser");
    assert!(parser.parse(SMS).await.is_none());
}

#[tokio::test]
async fn blank_text_skips_the_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("{}")))
        .expect(0)
        .mount(&server)
        .await;

    let parser = parser_for(&server, Duration::from_secs(5)).await;
    assert!(parser.parse("   ").await.is_none());
}
