//! In-memory backend, used by tests and `DATABASE_BACKEND=memory`.

use super::{HoldingStore, LedgerStore, RawMessageStore, StoreError, TransactionStore};
use crate::models::{
    HoldingAggregate, HoldingUpdate, InstrumentType, LedgerEntry, NewLedgerEntry, NewRawMessage,
    NewTransaction, RawMessage, Transaction,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    raw_messages: DashMap<Uuid, RawMessage>,
    external_ids: DashMap<String, Uuid>,
    transactions: DashMap<Uuid, Transaction>,
    // raw_message_id -> transaction id
    transactions_by_message: DashMap<Uuid, Uuid>,
    // dedupe_key -> transaction id
    transactions_by_key: DashMap<String, Uuid>,
    ledger: DashMap<Uuid, LedgerEntry>,
    holdings: DashMap<(InstrumentType, String), HoldingAggregate>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RawMessageStore for MemoryStore {
    async fn insert(&self, message: NewRawMessage) -> Result<RawMessage, StoreError> {
        let id = Uuid::new_v4();

        if let Some(external_id) = &message.external_id {
            match self.external_ids.entry(external_id.clone()) {
                Entry::Occupied(_) => {
                    return Err(StoreError::UniqueViolation(format!(
                        "external id {} already recorded",
                        external_id
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
            }
        }

        let stored = message.into_message(id, Utc::now());
        self.raw_messages.insert(id, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<RawMessage>, StoreError> {
        Ok(self.raw_messages.get(&id).map(|m| m.clone()))
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<RawMessage>, StoreError> {
        let Some(id) = self.external_ids.get(external_id).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.raw_messages.get(&id).map(|m| m.clone()))
    }

    async fn mark_admitted(&self, id: Uuid) -> Result<(), StoreError> {
        let mut message = self
            .raw_messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("raw message {}", id)))?;
        message.admitted = true;
        Ok(())
    }

    async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut message = self
            .raw_messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("raw message {}", id)))?;
        message.processed = true;
        if message.processed_at.is_none() {
            message.processed_at = Some(at);
        }
        Ok(())
    }

    async fn find_unprocessed(&self) -> Result<Vec<RawMessage>, StoreError> {
        let mut pending: Vec<RawMessage> = self
            .raw_messages
            .iter()
            .filter(|m| !m.processed)
            .map(|m| m.clone())
            .collect();
        pending.sort_by_key(|m| m.received_at);
        Ok(pending)
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert(&self, transaction: NewTransaction) -> Result<Transaction, StoreError> {
        let id = Uuid::new_v4();
        match self.transactions_by_key.entry(transaction.dedupe_key.clone()) {
            Entry::Occupied(_) => {
                return Err(StoreError::UniqueViolation(format!(
                    "dedupe key {} already recorded",
                    transaction.dedupe_key
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        match self.transactions_by_message.entry(transaction.raw_message_id) {
            Entry::Occupied(_) => {
                // Release the key claimed above.
                self.transactions_by_key.remove(&transaction.dedupe_key);
                return Err(StoreError::UniqueViolation(format!(
                    "raw message {} already has a transaction",
                    transaction.raw_message_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let stored = transaction.into_transaction(id, Utc::now());
        self.transactions.insert(id, stored.clone());
        Ok(stored)
    }

    async fn exists_by_dedupe_key_between(
        &self,
        dedupe_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.transactions.iter().any(|t| {
            t.dedupe_key == dedupe_key && t.transaction_date >= start && t.transaction_date <= end
        }))
    }

    async fn find_by_raw_message(
        &self,
        raw_message_id: Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        let Some(id) = self.transactions_by_message.get(&raw_message_id).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.transactions.get(&id).map(|t| t.clone()))
    }

    async fn count(&self) -> Result<i64, StoreError> {
        Ok(self.transactions.len() as i64)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        let id = Uuid::new_v4();
        let stored = entry.into_entry(id, Utc::now());
        self.ledger.insert(id, stored.clone());
        Ok(stored)
    }

    async fn find_by_raw_message(
        &self,
        raw_message_id: Uuid,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut entries: Vec<LedgerEntry> = self
            .ledger
            .iter()
            .filter(|e| e.raw_message_id == raw_message_id)
            .map(|e| e.clone())
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }
}

#[async_trait]
impl HoldingStore for MemoryStore {
    async fn upsert_buy(&self, update: HoldingUpdate) -> Result<HoldingAggregate, StoreError> {
        let key = (update.instrument_type, update.key_symbol().to_string());
        let now = Utc::now();

        // The entry guard holds the shard lock for the read-modify-write.
        let holding = match self.holdings.entry(key) {
            Entry::Occupied(mut slot) => {
                let merged = update.apply(Some(slot.get().clone()), now);
                slot.insert(merged.clone());
                merged
            }
            Entry::Vacant(slot) => {
                let created = update.apply(None, now);
                slot.insert(created.clone());
                created
            }
        };
        Ok(holding)
    }

    async fn find_by_key(
        &self,
        instrument_type: InstrumentType,
        symbol: &str,
    ) -> Result<Option<HoldingAggregate>, StoreError> {
        Ok(self
            .holdings
            .get(&(instrument_type, symbol.to_string()))
            .map(|h| h.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageSource, TransactionType};

    fn pending(external_id: Option<&str>) -> NewRawMessage {
        NewRawMessage::pending(
            MessageSource::Email,
            external_id.map(str::to_string),
            "alerts@bank.example".to_string(),
            "Rs.500 debited".to_string(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn external_id_is_unique() {
        let store = MemoryStore::new();
        RawMessageStore::insert(&store, pending(Some("m-1"))).await.unwrap();

        let second = RawMessageStore::insert(&store, pending(Some("m-1"))).await;
        assert!(matches!(second, Err(StoreError::UniqueViolation(_))));

        // Messages without an external id never collide.
        RawMessageStore::insert(&store, pending(None)).await.unwrap();
        RawMessageStore::insert(&store, pending(None)).await.unwrap();
    }

    #[tokio::test]
    async fn processed_messages_leave_the_backlog() {
        let store = MemoryStore::new();
        let message = RawMessageStore::insert(&store, pending(None)).await.unwrap();
        assert_eq!(store.find_unprocessed().await.unwrap().len(), 1);

        store.mark_processed(message.id, Utc::now()).await.unwrap();
        assert!(store.find_unprocessed().await.unwrap().is_empty());

        let reloaded = store.find_by_id(message.id).await.unwrap().unwrap();
        assert!(reloaded.processed_at.is_some());
    }

    fn debit(raw_message_id: Uuid, dedupe_key: &str) -> NewTransaction {
        NewTransaction {
            raw_message_id,
            amount: rust_decimal::Decimal::from(500),
            currency: "INR".to_string(),
            merchant_name: Some("Amazon".to_string()),
            category: None,
            transaction_type: TransactionType::Debit,
            transaction_date: Utc::now(),
            description: None,
            dedupe_key: dedupe_key.to_string(),
        }
    }

    #[tokio::test]
    async fn dedupe_key_is_unique() {
        let store = MemoryStore::new();
        TransactionStore::insert(&store, debit(Uuid::new_v4(), "k1")).await.unwrap();

        let second = TransactionStore::insert(&store, debit(Uuid::new_v4(), "k1")).await;
        assert!(matches!(second, Err(StoreError::UniqueViolation(_))));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_transaction_for_a_message_frees_its_key() {
        let store = MemoryStore::new();
        let message_id = Uuid::new_v4();
        TransactionStore::insert(&store, debit(message_id, "k1")).await.unwrap();

        let clash = TransactionStore::insert(&store, debit(message_id, "k2")).await;
        assert!(matches!(clash, Err(StoreError::UniqueViolation(_))));

        // "k2" was not left claimed by the failed insert.
        TransactionStore::insert(&store, debit(Uuid::new_v4(), "k2")).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn marking_unknown_message_is_not_found() {
        let store = MemoryStore::new();
        let result = store.mark_admitted(Uuid::new_v4()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
