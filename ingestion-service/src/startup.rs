//! Application startup and lifecycle management.

use crate::config::{DatabaseBackend, IngestionConfig};
use crate::handlers;
use crate::services::mailbox::{GmailMailbox, Mailbox};
use crate::services::parser::{build_parser, TransactionParser};
use crate::services::{Database, IngestionCoordinator, Notifier, Stores};
use crate::workers::{
    BacklogSweeper, DispatchHandle, ExtractionDispatcher, ExtractionPipeline, HoldingsExtractor,
    MailboxPoller, TransactionExtractor,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use service_core::error::AppError;
use service_core::middleware::api_key::{api_key_middleware, ApiKeyConfig};
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub const BRIDGE_PREFIX: &str = "/api/v1/bridge";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: IngestionConfig,
    pub stores: Stores,
    pub coordinator: IngestionCoordinator,
    pub notifier: Notifier,
    api_key: ApiKeyConfig,
}

impl AsRef<ApiKeyConfig> for AppState {
    fn as_ref(&self) -> &ApiKeyConfig {
        &self.api_key
    }
}

/// External capabilities the pipeline talks to.
pub struct Collaborators {
    pub parser: Arc<dyn TransactionParser>,
    pub mailbox: Option<Arc<dyn Mailbox>>,
}

impl Collaborators {
    pub fn from_config(config: &IngestionConfig) -> Result<Self, AppError> {
        let parser = build_parser(&config.parser)?;

        let mailbox: Option<Arc<dyn Mailbox>> = if config.mailbox.enabled {
            let token = config.mailbox.access_token.as_deref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "MAILBOX_ACCESS_TOKEN is required when the mailbox poller is enabled"
                ))
            })?;
            Some(Arc::new(GmailMailbox::new(
                &config.mailbox.api_base,
                &config.mailbox.user_id,
                token,
            )?))
        } else {
            None
        };

        Ok(Self { parser, mailbox })
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    router: Router,
    state: AppState,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with collaborators taken from configuration.
    pub async fn build(config: IngestionConfig) -> Result<Self, AppError> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::build_with(config, collaborators).await
    }

    /// Build the application around the given collaborators.
    pub async fn build_with(
        config: IngestionConfig,
        collaborators: Collaborators,
    ) -> Result<Self, AppError> {
        let stores = match config.database.backend {
            DatabaseBackend::Postgres => {
                let url = config.database.url.as_deref().ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is not set"))
                })?;
                let db = Database::new(
                    url,
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Stores::postgres(db)
            }
            DatabaseBackend::Memory => {
                tracing::warn!("Using in-memory storage; data is lost on restart");
                Stores::in_memory()
            }
        };

        let notifier = Notifier::new();
        let shutdown = CancellationToken::new();

        let transaction_extractor = Arc::new(TransactionExtractor::new(
            collaborators.parser,
            stores.raw_messages.clone(),
            stores.transactions.clone(),
            notifier.clone(),
            config.parser.default_currency.clone(),
        ));
        let holdings_extractor = Arc::new(HoldingsExtractor::new(
            stores.ledger.clone(),
            stores.holdings.clone(),
            config.parser.default_currency.clone(),
        ));
        let pipeline = Arc::new(ExtractionPipeline::new(
            stores.raw_messages.clone(),
            transaction_extractor.clone(),
            holdings_extractor,
        ));

        let dispatch = if config.worker.enabled {
            let (dispatcher, handle) =
                ExtractionDispatcher::new(config.worker.clone(), pipeline, shutdown.clone());
            dispatcher.start().await;
            handle
        } else {
            tracing::info!("Extraction workers disabled by configuration");
            DispatchHandle::disabled()
        };

        let coordinator =
            IngestionCoordinator::new(stores.raw_messages.clone(), dispatch, notifier.clone());

        if config.worker.enabled {
            let sweeper = BacklogSweeper::new(
                stores.raw_messages.clone(),
                transaction_extractor,
                config.worker.backlog_interval(),
            );
            tokio::spawn(sweeper.run(shutdown.clone()));
        }

        if let Some(mailbox) = collaborators.mailbox {
            let poller = MailboxPoller::new(
                mailbox,
                coordinator.clone(),
                config.mailbox.clone(),
                Utc::now(),
            );
            tokio::spawn(poller.run(shutdown.clone()));
        }

        let api_key = ApiKeyConfig {
            api_key: config.security.api_key.clone().unwrap_or_default(),
            protected_prefix: BRIDGE_PREFIX.to_string(),
            excluded_paths: vec![format!("{}/health", BRIDGE_PREFIX)],
        };

        let state = AppState {
            config: config.clone(),
            stores,
            coordinator,
            notifier,
            api_key,
        };

        let router = build_router(state.clone());

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Ingestion service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            router,
            state,
            shutdown,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Token that stops the server and every background task.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        tracing::info!(
            service = "ingestion-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let shutdown = self.shutdown.clone();
        let result = axum::serve(self.http_listener, self.router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await;

        // Stop workers and pollers with the server.
        shutdown.cancel();
        result
    }
}

fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route(&format!("{}/ingest", BRIDGE_PREFIX), post(handlers::ingest_sms))
        .route(&format!("{}/health", BRIDGE_PREFIX), get(handlers::bridge_health));

    if state.config.security.api_key.is_some() {
        router = router.layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware::<AppState>,
        ));
    } else {
        tracing::warn!("BRIDGE_API_KEY not set; bridge endpoints are unauthenticated");
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
