//! Persistence seams for ingestion-service.
//!
//! Each entity gets its own store trait so the coordinator and workers can be
//! wired against PostgreSQL in production and the in-memory backend in tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::Database;

use crate::models::{
    HoldingAggregate, HoldingUpdate, InstrumentType, LedgerEntry, NewLedgerEntry, NewRawMessage,
    NewTransaction, RawMessage, Transaction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    /// The backend refused the values themselves; retrying cannot succeed.
    #[error("Record rejected: {0}")]
    Rejected(String),

    #[error("Storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            StoreError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            StoreError::Rejected(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            StoreError::Backend(e) => AppError::DatabaseError(e),
        }
    }
}

#[async_trait]
pub trait RawMessageStore: Send + Sync {
    /// Fails with `UniqueViolation` when the external id is already recorded.
    async fn insert(&self, message: NewRawMessage) -> Result<RawMessage, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<RawMessage>, StoreError>;

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<RawMessage>, StoreError>;

    async fn mark_admitted(&self, id: Uuid) -> Result<(), StoreError>;

    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Messages with `processed = false`, oldest first.
    async fn find_unprocessed(&self) -> Result<Vec<RawMessage>, StoreError>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Fails with `UniqueViolation` when the raw message already produced a
    /// transaction.
    async fn insert(&self, transaction: NewTransaction) -> Result<Transaction, StoreError>;

    async fn exists_by_dedupe_key_between(
        &self,
        dedupe_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn find_by_raw_message(
        &self,
        raw_message_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError>;

    async fn find_by_raw_message(
        &self,
        raw_message_id: Uuid,
    ) -> Result<Vec<LedgerEntry>, StoreError>;
}

#[async_trait]
pub trait HoldingStore: Send + Sync {
    /// Folds a buy into the aggregate for its key atomically.
    async fn upsert_buy(&self, update: HoldingUpdate) -> Result<HoldingAggregate, StoreError>;

    async fn find_by_key(
        &self,
        instrument_type: InstrumentType,
        symbol: &str,
    ) -> Result<Option<HoldingAggregate>, StoreError>;
}

/// Bundle of store handles shared by the HTTP layer and the workers.
#[derive(Clone)]
pub struct Stores {
    pub raw_messages: Arc<dyn RawMessageStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub holdings: Arc<dyn HoldingStore>,
    database: Option<Database>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            raw_messages: store.clone(),
            transactions: store.clone(),
            ledger: store.clone(),
            holdings: store,
            database: None,
        }
    }

    pub fn postgres(db: Database) -> Self {
        let shared = Arc::new(db.clone());
        Self {
            raw_messages: shared.clone(),
            transactions: shared.clone(),
            ledger: shared.clone(),
            holdings: shared,
            database: Some(db),
        }
    }

    /// Backend liveness. The in-memory backend is always healthy.
    pub async fn health_check(&self) -> Result<(), AppError> {
        match &self.database {
            Some(db) => db.health_check().await,
            None => Ok(()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        if self.database.is_some() {
            "postgres"
        } else {
            "memory"
        }
    }
}
