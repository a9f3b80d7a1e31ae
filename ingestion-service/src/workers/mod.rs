pub mod backlog;
pub mod dispatcher;
pub mod holdings_extractor;
pub mod mailbox_poller;
pub mod transaction_extractor;

pub use backlog::{BacklogSweeper, SweepReport};
pub use dispatcher::{DispatchHandle, ExtractionDispatcher, ExtractionJob, ExtractionPipeline};
pub use holdings_extractor::HoldingsExtractor;
pub use mailbox_poller::{MailboxPoller, PollReport};
pub use transaction_extractor::{ExtractionOutcome, TransactionExtractor};
