//! PostgreSQL backend for the ingestion stores.

use super::{HoldingStore, LedgerStore, RawMessageStore, StoreError, TransactionStore};
use crate::models::{
    HoldingAggregate, HoldingUpdate, InstrumentType, LedgerEntry, NewLedgerEntry, NewRawMessage,
    NewTransaction, RawMessage, Transaction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::{Duration, Instant};
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "ingestion-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

fn observe(operation: &'static str, start: Instant) {
    metrics::histogram!("ingestion_db_query_duration_seconds", "operation" => operation)
        .record(start.elapsed().as_secs_f64());
}

fn map_sqlx(context: &str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StoreError::UniqueViolation(format!("{}: {}", context, db_err.message()))
        }
        sqlx::Error::Database(ref db_err)
            if db_err.code().is_some_and(|code| is_data_rejection(&code)) =>
        {
            StoreError::Rejected(format!("{}: {}", context, db_err.message()))
        }
        _ => StoreError::Backend(anyhow::anyhow!("{}: {}", context, e)),
    }
}

/// SQLSTATE class 22 (data exception) and class 23 (integrity constraint)
/// fail the same way on every retry. Unique violations are handled apart.
fn is_data_rejection(sqlstate: &str) -> bool {
    const UNIQUE_VIOLATION: &str = "23505";
    (sqlstate.starts_with("22") || sqlstate.starts_with("23")) && sqlstate != UNIQUE_VIOLATION
}

fn parse_column<T>(value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| StoreError::Backend(anyhow::anyhow!(e)))
}

// -------------------------------------------------------------------------
// Row mappings
// -------------------------------------------------------------------------

#[derive(FromRow)]
struct RawMessageRow {
    id: Uuid,
    source: String,
    external_id: Option<String>,
    sender: String,
    body: String,
    received_at: DateTime<Utc>,
    processed: bool,
    processed_at: Option<DateTime<Utc>>,
    admitted: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<RawMessageRow> for RawMessage {
    type Error = StoreError;

    fn try_from(row: RawMessageRow) -> Result<Self, Self::Error> {
        Ok(RawMessage {
            id: row.id,
            source: parse_column(&row.source)?,
            external_id: row.external_id,
            sender: row.sender,
            body: row.body,
            received_at: row.received_at,
            processed: row.processed,
            processed_at: row.processed_at,
            admitted: row.admitted,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    raw_message_id: Uuid,
    amount: Decimal,
    currency: String,
    merchant_name: Option<String>,
    category: Option<String>,
    transaction_type: String,
    transaction_date: DateTime<Utc>,
    description: Option<String>,
    dedupe_key: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            raw_message_id: row.raw_message_id,
            amount: row.amount,
            currency: row.currency,
            merchant_name: row.merchant_name,
            category: row.category,
            transaction_type: parse_column(&row.transaction_type)?,
            transaction_date: row.transaction_date,
            description: row.description,
            dedupe_key: row.dedupe_key,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct LedgerEntryRow {
    id: Uuid,
    raw_message_id: Uuid,
    entry_type: String,
    instrument_type: String,
    symbol: Option<String>,
    name: String,
    quantity: Decimal,
    price: Option<Decimal>,
    amount: Decimal,
    currency: String,
    ledger_date: DateTime<Utc>,
    description: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerEntryRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerEntryRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: row.id,
            raw_message_id: row.raw_message_id,
            entry_type: parse_column(&row.entry_type)?,
            instrument_type: parse_column(&row.instrument_type)?,
            symbol: row.symbol,
            name: row.name,
            quantity: row.quantity,
            price: row.price,
            amount: row.amount,
            currency: row.currency,
            ledger_date: row.ledger_date,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct HoldingRow {
    id: Uuid,
    instrument_type: String,
    symbol: String,
    name: String,
    quantity: Decimal,
    average_price: Option<Decimal>,
    current_value: Option<Decimal>,
    currency: String,
    last_raw_message_id: Uuid,
    last_updated: DateTime<Utc>,
}

impl TryFrom<HoldingRow> for HoldingAggregate {
    type Error = StoreError;

    fn try_from(row: HoldingRow) -> Result<Self, Self::Error> {
        Ok(HoldingAggregate {
            id: row.id,
            instrument_type: parse_column(&row.instrument_type)?,
            symbol: row.symbol,
            name: row.name,
            quantity: row.quantity,
            average_price: row.average_price,
            current_value: row.current_value,
            currency: row.currency,
            last_raw_message_id: row.last_raw_message_id,
            last_updated: row.last_updated,
        })
    }
}

const RAW_MESSAGE_COLUMNS: &str = "id, source, external_id, sender, body, received_at, processed, processed_at, admitted, created_at";

const TRANSACTION_COLUMNS: &str = "id, raw_message_id, amount, currency, merchant_name, category, transaction_type, transaction_date, description, dedupe_key, created_at";

const LEDGER_COLUMNS: &str = "id, raw_message_id, entry_type, instrument_type, symbol, name, quantity, price, amount, currency, ledger_date, description, created_at";

const HOLDING_COLUMNS: &str = "id, instrument_type, symbol, name, quantity, average_price, current_value, currency, last_raw_message_id, last_updated";

// -------------------------------------------------------------------------
// Raw messages
// -------------------------------------------------------------------------

#[async_trait]
impl RawMessageStore for Database {
    #[instrument(skip(self, message), fields(source = %message.source, external_id = ?message.external_id))]
    async fn insert(&self, message: NewRawMessage) -> Result<RawMessage, StoreError> {
        let start = Instant::now();
        let now = Utc::now();

        let row = sqlx::query_as::<_, RawMessageRow>(&format!(
            r#"
            INSERT INTO raw_messages (id, source, external_id, sender, body, received_at, processed, processed_at, admitted, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            RAW_MESSAGE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(message.source.as_str())
        .bind(&message.external_id)
        .bind(&message.sender)
        .bind(&message.body)
        .bind(message.received_at)
        .bind(message.processed)
        .bind(message.processed.then_some(now))
        .bind(message.admitted)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to insert raw message", e))?;

        observe("insert_raw_message", start);
        row.try_into()
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> Result<Option<RawMessage>, StoreError> {
        let start = Instant::now();
        let row = sqlx::query_as::<_, RawMessageRow>(&format!(
            "SELECT {} FROM raw_messages WHERE id = $1",
            RAW_MESSAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to load raw message", e))?;

        observe("find_raw_message", start);
        row.map(RawMessage::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<RawMessage>, StoreError> {
        let start = Instant::now();
        let row = sqlx::query_as::<_, RawMessageRow>(&format!(
            "SELECT {} FROM raw_messages WHERE external_id = $1",
            RAW_MESSAGE_COLUMNS
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to look up external id", e))?;

        observe("find_raw_message_by_external_id", start);
        row.map(RawMessage::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn mark_admitted(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE raw_messages SET admitted = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("Failed to mark message admitted", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("raw message {}", id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE raw_messages SET processed = TRUE, processed_at = COALESCE(processed_at, $2) WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to mark message processed", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("raw message {}", id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_unprocessed(&self) -> Result<Vec<RawMessage>, StoreError> {
        let start = Instant::now();
        let rows = sqlx::query_as::<_, RawMessageRow>(&format!(
            "SELECT {} FROM raw_messages WHERE processed = FALSE ORDER BY received_at ASC",
            RAW_MESSAGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to list unprocessed messages", e))?;

        observe("find_unprocessed", start);
        rows.into_iter().map(RawMessage::try_from).collect()
    }
}

// -------------------------------------------------------------------------
// Transactions
// -------------------------------------------------------------------------

#[async_trait]
impl TransactionStore for Database {
    #[instrument(skip(self, transaction), fields(raw_message_id = %transaction.raw_message_id))]
    async fn insert(&self, transaction: NewTransaction) -> Result<Transaction, StoreError> {
        let start = Instant::now();
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            INSERT INTO transactions (id, raw_message_id, amount, currency, merchant_name, category, transaction_type, transaction_date, description, dedupe_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(transaction.raw_message_id)
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(&transaction.merchant_name)
        .bind(&transaction.category)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.transaction_date)
        .bind(&transaction.description)
        .bind(&transaction.dedupe_key)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to insert transaction", e))?;

        observe("insert_transaction", start);
        row.try_into()
    }

    #[instrument(skip(self))]
    async fn exists_by_dedupe_key_between(
        &self,
        dedupe_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let timer = Instant::now();
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM transactions
                WHERE dedupe_key = $1 AND transaction_date BETWEEN $2 AND $3
            )
            "#,
        )
        .bind(dedupe_key)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to check dedupe key", e))?;

        observe("exists_by_dedupe_key", timer);
        Ok(exists)
    }

    #[instrument(skip(self))]
    async fn find_by_raw_message(
        &self,
        raw_message_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE raw_message_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(raw_message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to load transaction", e))?;

        row.map(Transaction::try_from).transpose()
    }

    async fn count(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM transactions")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx("Failed to count transactions", e))
    }
}

// -------------------------------------------------------------------------
// Investment ledger and holdings
// -------------------------------------------------------------------------

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self, entry), fields(raw_message_id = %entry.raw_message_id, entry_type = entry.entry_type.as_str()))]
    async fn insert(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        let start = Instant::now();
        let row = sqlx::query_as::<_, LedgerEntryRow>(&format!(
            r#"
            INSERT INTO ledger_entries (id, raw_message_id, entry_type, instrument_type, symbol, name, quantity, price, amount, currency, ledger_date, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            LEDGER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(entry.raw_message_id)
        .bind(entry.entry_type.as_str())
        .bind(entry.instrument_type.as_str())
        .bind(&entry.symbol)
        .bind(&entry.name)
        .bind(entry.quantity)
        .bind(entry.price)
        .bind(entry.amount)
        .bind(&entry.currency)
        .bind(entry.ledger_date)
        .bind(&entry.description)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to insert ledger entry", e))?;

        observe("insert_ledger_entry", start);
        row.try_into()
    }

    #[instrument(skip(self))]
    async fn find_by_raw_message(
        &self,
        raw_message_id: Uuid,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LedgerEntryRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE raw_message_id = $1 ORDER BY created_at ASC",
            LEDGER_COLUMNS
        ))
        .bind(raw_message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to list ledger entries", e))?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }
}

#[async_trait]
impl HoldingStore for Database {
    #[instrument(skip(self, update), fields(instrument_type = update.instrument_type.as_str(), symbol = %update.key_symbol()))]
    async fn upsert_buy(&self, update: HoldingUpdate) -> Result<HoldingAggregate, StoreError> {
        let start = Instant::now();
        let row = sqlx::query_as::<_, HoldingRow>(&format!(
            r#"
            INSERT INTO holdings (id, instrument_type, symbol, name, quantity, average_price, current_value, currency, last_raw_message_id, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (instrument_type, symbol) DO UPDATE SET
                quantity = holdings.quantity + EXCLUDED.quantity,
                average_price = COALESCE(EXCLUDED.average_price, holdings.average_price),
                current_value = COALESCE(EXCLUDED.current_value, holdings.current_value),
                name = CASE WHEN EXCLUDED.name <> '' THEN EXCLUDED.name ELSE holdings.name END,
                last_raw_message_id = EXCLUDED.last_raw_message_id,
                last_updated = EXCLUDED.last_updated
            RETURNING {}
            "#,
            HOLDING_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(update.instrument_type.as_str())
        .bind(update.key_symbol())
        .bind(&update.name)
        .bind(update.quantity)
        .bind(update.average_price)
        .bind(update.current_value)
        .bind(&update.currency)
        .bind(update.raw_message_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to upsert holding", e))?;

        observe("upsert_holding", start);
        row.try_into()
    }

    #[instrument(skip(self))]
    async fn find_by_key(
        &self,
        instrument_type: InstrumentType,
        symbol: &str,
    ) -> Result<Option<HoldingAggregate>, StoreError> {
        let row = sqlx::query_as::<_, HoldingRow>(&format!(
            "SELECT {} FROM holdings WHERE instrument_type = $1 AND symbol = $2",
            HOLDING_COLUMNS
        ))
        .bind(instrument_type.as_str())
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("Failed to load holding", e))?;

        row.map(HoldingAggregate::try_from).transpose()
    }
}
