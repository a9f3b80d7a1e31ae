//! Common test utilities for ingestion-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingestion_service::config::{
    DatabaseBackend, DatabaseConfig, IngestionConfig, MailboxConfig, ParserConfig, SecurityConfig,
    WorkerConfig,
};
use ingestion_service::services::mailbox::{
    MailHeader, MailMessage, Mailbox, MailboxError, MimePart,
};
use ingestion_service::services::parser::{ParsedTransaction, TransactionParser};
use ingestion_service::startup::{AppState, Application, Collaborators};
use service_core::config::Config as CommonConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TEST_API_KEY: &str = "test-bridge-key";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,ingestion_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn test_config(api_key: Option<&str>) -> IngestionConfig {
    IngestionConfig {
        common: CommonConfig {
            port: 0,
            environment: "test".to_string(),
        },
        service_name: "ingestion-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            backend: DatabaseBackend::Memory,
            url: None,
            max_connections: 2,
            min_connections: 1,
        },
        security: SecurityConfig {
            api_key: api_key.map(str::to_string),
        },
        parser: ParserConfig {
            enabled: false,
            base_url: "http://127.0.0.1:1".to_string(),
            model: "test-model".to_string(),
            timeout_secs: 5,
            default_currency: "INR".to_string(),
        },
        worker: WorkerConfig {
            enabled: true,
            worker_count: 2,
            queue_size: 64,
            backlog_interval_secs: 3600,
        },
        mailbox: MailboxConfig::default(),
    }
}

/// Parser that answers from a table of body fragments.
#[derive(Default)]
pub struct FakeParser {
    replies: Mutex<Vec<(String, ParsedTransaction)>>,
    calls: AtomicUsize,
}

impl FakeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any body containing `fragment` parses to `parsed`.
    pub fn reply_for(self, fragment: &str, parsed: ParsedTransaction) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push((fragment.to_string(), parsed));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionParser for FakeParser {
    async fn parse(&self, text: &str) -> Option<ParsedTransaction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .iter()
            .find(|(fragment, _)| text.contains(fragment.as_str()))
            .map(|(_, parsed)| parsed.clone())
    }
}

/// Scripted mailbox holding a fixed set of messages.
#[derive(Default)]
pub struct FakeMailbox {
    messages: Mutex<HashMap<String, MailMessage>>,
    order: Mutex<Vec<String>>,
    broken_ids: Mutex<Vec<String>>,
    fail_search: AtomicBool,
    queries: Mutex<Vec<String>>,
    fetches: AtomicUsize,
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&self, id: &str, from: &str, subject: &str, body: &str, received: DateTime<Utc>) {
        self.messages
            .lock()
            .unwrap()
            .insert(id.to_string(), mail_message(id, from, subject, body, received));
        self.order.lock().unwrap().push(id.to_string());
    }

    /// Listed by search, but every fetch of it fails.
    pub fn add_broken(&self, id: &str) {
        self.broken_ids.lock().unwrap().push(id.to_string());
        self.order.lock().unwrap().push(id.to_string());
    }

    pub fn set_search_failure(&self, fail: bool) {
        self.fail_search.store(fail, Ordering::SeqCst);
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    async fn search(
        &self,
        query: &str,
        _label: &str,
        max_results: u32,
    ) -> Result<Vec<String>, MailboxError> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(MailboxError::Network("connection refused".to_string()));
        }
        Ok(self
            .order
            .lock()
            .unwrap()
            .iter()
            .take(max_results as usize)
            .cloned()
            .collect())
    }

    async fn fetch(&self, id: &str) -> Result<MailMessage, MailboxError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.broken_ids.lock().unwrap().iter().any(|b| b == id) {
            return Err(MailboxError::Api(format!("message {} unavailable", id)));
        }
        self.messages
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| MailboxError::Api(format!("message {} not found", id)))
    }
}

/// Single-part plain text message as the provider would return it.
pub fn mail_message(
    id: &str,
    from: &str,
    subject: &str,
    body: &str,
    received: DateTime<Utc>,
) -> MailMessage {
    use base64::Engine;
    MailMessage {
        id: id.to_string(),
        internal_date_ms: Some(received.timestamp_millis()),
        payload: MimePart {
            mime_type: "text/plain".to_string(),
            headers: vec![
                MailHeader {
                    name: "From".to_string(),
                    value: from.to_string(),
                },
                MailHeader {
                    name: "Subject".to_string(),
                    value: subject.to_string(),
                },
            ],
            body_data: Some(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(body)),
            parts: Vec::new(),
        },
    }
}

pub struct TestApp {
    pub http_address: String,
    pub api_key: Option<String>,
    pub state: AppState,
    shutdown: CancellationToken,
}

impl TestApp {
    /// Memory backend, disabled parser, bridge protected by `TEST_API_KEY`.
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config(Some(TEST_API_KEY)), Arc::new(FakeParser::new())).await
    }

    pub async fn spawn_with(config: IngestionConfig, parser: Arc<dyn TransactionParser>) -> Self {
        init_tracing();

        let api_key = config.security.api_key.clone();
        let collaborators = Collaborators {
            parser,
            mailbox: None,
        };

        let app = Application::build_with(config, collaborators)
            .await
            .expect("Failed to build application");

        let http_address = format!("http://127.0.0.1:{}", app.http_port());
        let state = app.state().clone();
        let shutdown = app.shutdown_token();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        Self {
            http_address,
            api_key,
            state,
            shutdown,
        }
    }

    pub async fn post_sms(&self, body: serde_json::Value) -> reqwest::Response {
        let mut request = reqwest::Client::new()
            .post(format!("{}/api/v1/bridge/ingest", self.http_address))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }
        request.send().await.expect("Failed to execute request")
    }

    pub fn cleanup(&self) {
        self.shutdown.cancel();
    }
}

/// Polls `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..40 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
