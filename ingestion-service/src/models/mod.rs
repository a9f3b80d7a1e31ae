//! Domain models for ingestion-service.

mod holding;
mod raw_message;
mod transaction;

pub use holding::{
    EntryType, HoldingAggregate, HoldingUpdate, InstrumentType, LedgerEntry, NewLedgerEntry,
};
pub use raw_message::{MessageSource, NewRawMessage, RawMessage};
pub use transaction::{dedupe_key, dedupe_window, NewTransaction, Transaction, TransactionType};
