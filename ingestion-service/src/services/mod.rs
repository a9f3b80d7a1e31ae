pub mod admission;
pub mod ingestion;
pub mod mailbox;
pub mod metrics;
pub mod notifier;
pub mod parser;
pub mod store;

pub use ingestion::{IncomingMessage, IngestOutcome, IngestionCoordinator};
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{IngestEvent, Notifier};
pub use store::{Database, MemoryStore, StoreError, Stores};
