//! Configuration module for ingestion-service.

use service_core::config::{self as core_config, get_env, get_env_parsed};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub parser: ParserConfig,
    pub worker: WorkerConfig,
    pub mailbox: MailboxConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Postgres,
    Memory,
}

impl std::str::FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseBackend::Postgres),
            "memory" => Ok(DatabaseBackend::Memory),
            _ => Err(format!("Invalid database backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Shared secret for the bridge endpoints. `None` leaves them open.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub default_currency: String,
}

impl ParserConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_count: usize,
    pub queue_size: usize,
    pub backlog_interval_secs: u64,
}

impl WorkerConfig {
    pub fn backlog_interval(&self) -> Duration {
        Duration::from_secs(self.backlog_interval_secs)
    }
}

#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub enabled: bool,
    pub api_base: String,
    pub access_token: Option<String>,
    pub user_id: String,
    pub label: String,
    pub poll_interval_secs: u64,
    pub initial_lookback_minutes: i64,
    pub overlap_secs: i64,
    pub max_results: u32,
    pub search_keywords: Vec<String>,
}

impl MailboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_count: 4,
            queue_size: 1024,
            backlog_interval_secs: 300,
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: "https://gmail.googleapis.com".to_string(),
            access_token: None,
            user_id: "me".to_string(),
            label: "INBOX".to_string(),
            poll_interval_secs: 60,
            initial_lookback_minutes: 1440,
            overlap_secs: 60,
            max_results: 50,
            search_keywords: split_keywords("debit,credit,transaction,payment"),
        }
    }
}

impl IngestionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = common.is_prod();

        let backend: DatabaseBackend = get_env("DATABASE_BACKEND", Some("postgres"), is_prod)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let url = env::var("DATABASE_URL").ok();
        if backend == DatabaseBackend::Postgres && url.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_URL is required for the postgres backend"
            )));
        }

        let api_key = env::var("BRIDGE_API_KEY").ok().filter(|k| !k.is_empty());
        if is_prod && api_key.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BRIDGE_API_KEY is required in production but not set"
            )));
        }

        let mailbox_defaults = MailboxConfig::default();
        let worker_defaults = WorkerConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "ingestion-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                backend,
                url,
                max_connections: get_env_parsed("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: get_env_parsed("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            security: SecurityConfig {
                api_key,
            },
            parser: ParserConfig {
                enabled: get_env_parsed("PARSER_ENABLED", true)?,
                base_url: get_env("OLLAMA_BASE_URL", Some("http://localhost:11434"), false)?,
                model: get_env("OLLAMA_MODEL", Some("llama3.2"), false)?,
                timeout_secs: get_env_parsed("PARSER_TIMEOUT_SECS", 60)?,
                default_currency: get_env("DEFAULT_CURRENCY", Some("INR"), false)?,
            },
            worker: WorkerConfig {
                enabled: get_env_parsed("WORKER_ENABLED", worker_defaults.enabled)?,
                worker_count: get_env_parsed("WORKER_COUNT", worker_defaults.worker_count)?.max(1),
                queue_size: get_env_parsed("WORKER_QUEUE_SIZE", worker_defaults.queue_size)?
                    .max(1),
                backlog_interval_secs: get_env_parsed(
                    "BACKLOG_INTERVAL_SECS",
                    worker_defaults.backlog_interval_secs,
                )?
                .max(1),
            },
            mailbox: MailboxConfig {
                enabled: get_env_parsed("MAILBOX_ENABLED", mailbox_defaults.enabled)?,
                api_base: get_env("MAILBOX_API_BASE", Some(&mailbox_defaults.api_base), false)?,
                access_token: env::var("MAILBOX_ACCESS_TOKEN").ok().filter(|t| !t.is_empty()),
                user_id: get_env("MAILBOX_USER_ID", Some(&mailbox_defaults.user_id), false)?,
                label: get_env("MAILBOX_LABEL", Some(&mailbox_defaults.label), false)?,
                poll_interval_secs: get_env_parsed(
                    "MAILBOX_POLL_INTERVAL_SECS",
                    mailbox_defaults.poll_interval_secs,
                )?
                .max(1),
                initial_lookback_minutes: get_env_parsed(
                    "MAILBOX_INITIAL_LOOKBACK_MINUTES",
                    mailbox_defaults.initial_lookback_minutes,
                )?,
                overlap_secs: get_env_parsed("MAILBOX_OVERLAP_SECS", mailbox_defaults.overlap_secs)?,
                max_results: get_env_parsed("MAILBOX_MAX_RESULTS", mailbox_defaults.max_results)?,
                search_keywords: env::var("MAILBOX_SEARCH_KEYWORDS")
                    .map(|raw| split_keywords(&raw))
                    .unwrap_or(mailbox_defaults.search_keywords),
            },
        })
    }
}

/// Splits a comma separated keyword list, dropping blanks.
pub fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}
