//! Coordinator, extractor and sweeper tests against the in-memory backend.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::{init_tracing, FakeParser};
use ingestion_service::models::{
    InstrumentType, MessageSource, NewRawMessage, NewTransaction, Transaction, TransactionType,
};
use ingestion_service::services::parser::ParsedTransaction;
use ingestion_service::services::store::TransactionStore;
use ingestion_service::services::{
    IncomingMessage, IngestEvent, IngestOutcome, IngestionCoordinator, Notifier, StoreError,
    Stores,
};
use ingestion_service::workers::{
    BacklogSweeper, DispatchHandle, ExtractionOutcome, ExtractionPipeline, HoldingsExtractor,
    TransactionExtractor,
};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    stores: Stores,
    notifier: Notifier,
    coordinator: IngestionCoordinator,
    extractor: Arc<TransactionExtractor>,
    holdings: Arc<HoldingsExtractor>,
    parser: Arc<FakeParser>,
}

/// Wiring without the worker pool: admitted messages wait for an explicit
/// extraction call.
fn harness(parser: FakeParser) -> Harness {
    init_tracing();
    let stores = Stores::in_memory();
    let notifier = Notifier::new();
    let parser = Arc::new(parser);

    let extractor = Arc::new(TransactionExtractor::new(
        parser.clone(),
        stores.raw_messages.clone(),
        stores.transactions.clone(),
        notifier.clone(),
        "INR",
    ));
    let holdings = Arc::new(HoldingsExtractor::new(
        stores.ledger.clone(),
        stores.holdings.clone(),
        "INR",
    ));
    let coordinator = IngestionCoordinator::new(
        stores.raw_messages.clone(),
        DispatchHandle::disabled(),
        notifier.clone(),
    );

    Harness {
        stores,
        notifier,
        coordinator,
        extractor,
        holdings,
        parser,
    }
}

fn amazon_debit() -> ParsedTransaction {
    ParsedTransaction {
        amount: Decimal::from_str("500.00").unwrap(),
        currency: Some("INR".to_string()),
        merchant_name: Some("Amazon".to_string()),
        category: Some("SHOPPING".to_string()),
        transaction_type: TransactionType::Debit,
        transaction_date: Some(Utc.with_ymd_and_hms(2026, 1, 15, 10, 30, 0).unwrap()),
        description: Some("Card purchase at Amazon".to_string()),
    }
}

fn sms(body: &str) -> IncomingMessage {
    IncomingMessage {
        source: MessageSource::Sms,
        external_id: None,
        sender: "VM-HDFCBK".to_string(),
        body: body.to_string(),
        received_at: Utc.with_ymd_and_hms(2026, 1, 15, 10, 31, 0).unwrap(),
    }
}

fn email(id: &str, body: &str) -> IncomingMessage {
    IncomingMessage {
        source: MessageSource::Email,
        external_id: Some(id.to_string()),
        sender: "alerts@hdfcbank.net".to_string(),
        body: body.to_string(),
        received_at: Utc.with_ymd_and_hms(2026, 1, 15, 10, 35, 0).unwrap(),
    }
}

#[tokio::test]
async fn same_purchase_over_sms_and_email_yields_one_transaction() {
    let h = harness(FakeParser::new().reply_for("AMAZON", amazon_debit()));

    let sms_outcome = h
        .coordinator
        .ingest(sms("Rs.500.00 debited from A/c XX1234 at AMAZON on 15-01-26"))
        .await
        .unwrap();
    let email_outcome = h
        .coordinator
        .ingest(email(
            "18c2f0a1b",
            "Transaction alert: INR 500.00 spent on card XX1234 at AMAZON",
        ))
        .await
        .unwrap();

    let IngestOutcome::Admitted(first) = sms_outcome else {
        panic!("SMS was not admitted");
    };
    let IngestOutcome::Admitted(second) = email_outcome else {
        panic!("Email was not admitted");
    };

    let created = h.extractor.extract_one(&first).await.unwrap();
    assert!(matches!(created, ExtractionOutcome::Created(_)));

    let repeated = h.extractor.extract_one(&second).await.unwrap();
    assert!(matches!(repeated, ExtractionOutcome::Deduplicated { .. }));

    assert_eq!(h.stores.transactions.count().await.unwrap(), 1);

    // Both raw messages are kept and both are terminal.
    for id in [first.id, second.id] {
        let stored = h.stores.raw_messages.find_by_id(id).await.unwrap().unwrap();
        assert!(stored.processed);
        assert!(stored.processed_at.is_some());
    }
}

#[tokio::test]
async fn transaction_carries_parsed_fields() {
    let h = harness(FakeParser::new().reply_for("AMAZON", amazon_debit()));
    let mut events = h.notifier.subscribe();

    let IngestOutcome::Admitted(message) = h
        .coordinator
        .ingest(sms("Rs.500.00 debited from A/c XX1234 at AMAZON"))
        .await
        .unwrap()
    else {
        panic!("SMS was not admitted");
    };

    let ExtractionOutcome::Created(transaction) = h.extractor.extract_one(&message).await.unwrap()
    else {
        panic!("No transaction created");
    };

    assert_eq!(transaction.raw_message_id, message.id);
    assert_eq!(transaction.amount, Decimal::from(500));
    assert_eq!(transaction.currency, "INR");
    assert_eq!(transaction.transaction_type, TransactionType::Debit);
    assert_eq!(transaction.dedupe_key.len(), 64);

    let found = h
        .stores
        .transactions
        .find_by_raw_message(message.id)
        .await
        .unwrap();
    assert_eq!(found.map(|t| t.id), Some(transaction.id));

    // Ingest announcement first, then the transaction.
    assert!(matches!(
        events.recv().await.unwrap(),
        IngestEvent::RawMessageIngested { .. }
    ));
    match events.recv().await.unwrap() {
        IngestEvent::TransactionCreated { transaction_id, .. } => {
            assert_eq!(transaction_id, transaction.id)
        }
        other => panic!("Unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn purchases_outside_the_window_are_distinct() {
    let mut later = amazon_debit();
    later.transaction_date = Some(Utc.with_ymd_and_hms(2026, 1, 25, 9, 0, 0).unwrap());

    let h = harness(
        FakeParser::new()
            .reply_for("ORDER-1", amazon_debit())
            .reply_for("ORDER-2", later),
    );

    for body in [
        "Rs.500 debited at AMAZON ORDER-1",
        "Rs.500 debited at AMAZON ORDER-2",
    ] {
        let IngestOutcome::Admitted(message) = h.coordinator.ingest(sms(body)).await.unwrap() else {
            panic!("SMS was not admitted");
        };
        let outcome = h.extractor.extract_one(&message).await.unwrap();
        assert!(matches!(outcome, ExtractionOutcome::Created(_)));
    }

    assert_eq!(h.stores.transactions.count().await.unwrap(), 2);
}

#[tokio::test]
async fn unparsed_message_is_marked_processed_without_transaction() {
    let h = harness(FakeParser::new());

    let IngestOutcome::Admitted(message) = h
        .coordinator
        .ingest(sms("Rs.75 credited to A/c XX1234 as interest"))
        .await
        .unwrap()
    else {
        panic!("SMS was not admitted");
    };

    let outcome = h.extractor.extract_one(&message).await.unwrap();
    assert_eq!(outcome, ExtractionOutcome::NoMatch);

    let stored = h.stores.raw_messages.find_by_id(message.id).await.unwrap().unwrap();
    assert!(stored.processed);
    assert_eq!(h.stores.transactions.count().await.unwrap(), 0);

    // A second attempt does not ask the parser again.
    let again = h.extractor.extract_one(&stored).await.unwrap();
    assert_eq!(again, ExtractionOutcome::AlreadyProcessed);
    assert_eq!(h.parser.calls(), 1);
}

#[tokio::test]
async fn repeated_external_id_is_a_duplicate() {
    let h = harness(FakeParser::new());
    let body = "INR 1,250.00 debited via UPI to Swiggy";

    let first = h.coordinator.ingest(email("msg-1", body)).await.unwrap();
    assert!(matches!(first, IngestOutcome::Admitted(_)));

    let second = h.coordinator.ingest(email("msg-1", body)).await.unwrap();
    assert_eq!(
        second,
        IngestOutcome::Duplicate {
            external_id: "msg-1".to_string()
        }
    );
    assert!(h.coordinator.is_already_ingested("msg-1").await.unwrap());
    assert!(!h.coordinator.is_already_ingested("msg-2").await.unwrap());
}

#[tokio::test]
async fn half_written_record_is_resumed() {
    let h = harness(FakeParser::new());

    // Stored but never admitted, as after a crash between the two writes.
    let orphan = h
        .stores
        .raw_messages
        .insert(NewRawMessage::pending(
            MessageSource::Email,
            Some("msg-orphan".to_string()),
            "alerts@bank.example".to_string(),
            "Rs.900 debited from A/c XX1234".to_string(),
            Utc::now(),
        ))
        .await
        .unwrap();
    assert!(!h.coordinator.is_already_ingested("msg-orphan").await.unwrap());

    let outcome = h
        .coordinator
        .ingest(email("msg-orphan", "Rs.900 debited from A/c XX1234"))
        .await
        .unwrap();

    let IngestOutcome::Admitted(resumed) = outcome else {
        panic!("Orphan was not resumed");
    };
    assert_eq!(resumed.id, orphan.id);
    assert!(resumed.admitted);
    assert!(h.coordinator.is_already_ingested("msg-orphan").await.unwrap());
}

#[tokio::test]
async fn backlog_sweep_drives_pending_messages_to_a_verdict() {
    let h = harness(FakeParser::new().reply_for("AMAZON", amazon_debit()));

    h.coordinator
        .ingest(sms("Rs.500.00 debited from A/c XX1234 at AMAZON"))
        .await
        .unwrap();
    h.coordinator
        .ingest(sms("Rs.20 credited to A/c XX1234 as cashback reversal"))
        .await
        .unwrap();

    let sweeper = BacklogSweeper::new(
        h.stores.raw_messages.clone(),
        h.extractor.clone(),
        Duration::from_secs(3600),
    );

    let report = sweeper.sweep_once().await;
    assert_eq!(report.examined, 2);
    assert_eq!(report.created, 1);
    assert_eq!(report.no_match, 1);
    assert_eq!(report.failed, 0);

    assert!(h.stores.raw_messages.find_unprocessed().await.unwrap().is_empty());

    let second = sweeper.sweep_once().await;
    assert_eq!(second.examined, 0);
}

#[tokio::test]
async fn filtered_messages_are_never_swept() {
    let h = harness(FakeParser::new());

    let outcome = h
        .coordinator
        .ingest(sms("See you at 7 for the movie"))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Filtered(_)));

    assert!(h.stores.raw_messages.find_unprocessed().await.unwrap().is_empty());
    assert_eq!(h.parser.calls(), 0);
}

#[tokio::test]
async fn repeated_fund_purchases_accumulate() {
    let h = harness(FakeParser::new());

    for body in [
        "You purchased 10.5 units of XYZ Fund at NAV 45.20",
        "You purchased 5 units of XYZ Fund at NAV 46.10",
    ] {
        let IngestOutcome::Admitted(message) = h.coordinator.ingest(sms(body)).await.unwrap() else {
            panic!("SMS was not admitted");
        };
        let entries = h.holdings.extract(&message).await;
        assert_eq!(entries.len(), 1);
    }

    let holding = h
        .stores
        .holdings
        .find_by_key(InstrumentType::MutualFund, "XYZ Fund")
        .await
        .unwrap()
        .expect("Holding was not created");
    assert_eq!(holding.quantity, Decimal::from_str("15.5").unwrap());
    assert_eq!(holding.name, "XYZ Fund");
    assert_eq!(holding.currency, "INR");
}

#[tokio::test]
async fn long_fund_names_with_a_shared_prefix_stay_apart() {
    let h = harness(FakeParser::new());
    let growth = "Long Horizon Balanced Advantage Fund Direct Plan Growth Option";
    let dividend = "Long Horizon Balanced Advantage Fund Direct Plan Dividend Option";

    for (name, units) in [(growth, 10), (dividend, 4)] {
        let IngestOutcome::Admitted(message) = h
            .coordinator
            .ingest(sms(&format!("You purchased {} units of {}", units, name)))
            .await
            .unwrap()
        else {
            panic!("SMS was not admitted");
        };
        let entries = h.holdings.extract(&message).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].symbol, None);
    }

    for (name, units) in [(growth, 10), (dividend, 4)] {
        let holding = h
            .stores
            .holdings
            .find_by_key(InstrumentType::MutualFund, name)
            .await
            .unwrap()
            .expect("Holding was not created");
        assert_eq!(holding.quantity, Decimal::from(units));
        assert_eq!(holding.name, name);
    }
}

#[tokio::test]
async fn redemption_is_recorded_without_touching_the_holding() {
    let h = harness(FakeParser::new());

    let IngestOutcome::Admitted(buy) = h
        .coordinator
        .ingest(sms("You purchased 20 units of ABC Liquid Fund"))
        .await
        .unwrap()
    else {
        panic!("SMS was not admitted");
    };
    h.holdings.extract(&buy).await;

    let IngestOutcome::Admitted(sell) = h
        .coordinator
        .ingest(sms("You have redeemed 8 units of ABC Liquid Fund"))
        .await
        .unwrap()
    else {
        panic!("SMS was not admitted");
    };
    let entries = h.holdings.extract(&sell).await;
    assert_eq!(entries.len(), 1);

    let ledger = h.stores.ledger.find_by_raw_message(sell.id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert!(!ledger[0].entry_type.is_buy());

    let holding = h
        .stores
        .holdings
        .find_by_key(InstrumentType::MutualFund, "ABC Liquid Fund")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(holding.quantity, Decimal::from(20));
}

#[tokio::test]
async fn pipeline_runs_both_extractors() {
    let h = harness(FakeParser::new());
    let pipeline = ExtractionPipeline::new(
        h.stores.raw_messages.clone(),
        h.extractor.clone(),
        h.holdings.clone(),
    );

    let IngestOutcome::Admitted(message) = h
        .coordinator
        .ingest(sms("SIP of Rs.5000 processed. Units allotted: 45.12 in ABC Bluechip Fund"))
        .await
        .unwrap()
    else {
        panic!("SMS was not admitted");
    };

    pipeline.run(message.id).await;

    let stored = h.stores.raw_messages.find_by_id(message.id).await.unwrap().unwrap();
    assert!(stored.processed);
    let ledger = h.stores.ledger.find_by_raw_message(message.id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].name, "ABC Bluechip Fund");
}

/// Adds a round-trip delay to every call, like a remote database would.
struct SlowTransactions {
    inner: Arc<dyn TransactionStore>,
}

impl SlowTransactions {
    async fn round_trip(&self) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[async_trait]
impl TransactionStore for SlowTransactions {
    async fn insert(&self, transaction: NewTransaction) -> Result<Transaction, StoreError> {
        self.round_trip().await;
        self.inner.insert(transaction).await
    }

    async fn exists_by_dedupe_key_between(
        &self,
        dedupe_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.round_trip().await;
        self.inner
            .exists_by_dedupe_key_between(dedupe_key, start, end)
            .await
    }

    async fn find_by_raw_message(
        &self,
        raw_message_id: uuid::Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        self.round_trip().await;
        self.inner.find_by_raw_message(raw_message_id).await
    }

    async fn count(&self) -> Result<i64, StoreError> {
        self.inner.count().await
    }
}

/// Refuses every insert the way Postgres refuses values that do not fit a column.
struct RejectingTransactions;

#[async_trait]
impl TransactionStore for RejectingTransactions {
    async fn insert(&self, _transaction: NewTransaction) -> Result<Transaction, StoreError> {
        Err(StoreError::Rejected(
            "value too long for type character varying(8)".to_string(),
        ))
    }

    async fn exists_by_dedupe_key_between(
        &self,
        _dedupe_key: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn find_by_raw_message(
        &self,
        _raw_message_id: uuid::Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(None)
    }

    async fn count(&self) -> Result<i64, StoreError> {
        Ok(0)
    }
}

async fn admitted(h: &Harness, message: IncomingMessage) -> ingestion_service::models::RawMessage {
    match h.coordinator.ingest(message).await.unwrap() {
        IngestOutcome::Admitted(stored) => stored,
        other => panic!("Message was not admitted: {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_copies_of_one_event_yield_one_transaction() {
    let h = harness(FakeParser::new().reply_for("AMAZON", amazon_debit()));
    let first = admitted(&h, sms("Rs.500.00 debited from A/c XX1234 at AMAZON on 15-01-26")).await;
    let second = admitted(
        &h,
        email("18c2f0a1c", "Transaction alert: INR 500.00 spent on card XX1234 at AMAZON"),
    )
    .await;

    let slow = Arc::new(SlowTransactions {
        inner: h.stores.transactions.clone(),
    });
    let extractor = TransactionExtractor::new(
        h.parser.clone(),
        h.stores.raw_messages.clone(),
        slow,
        h.notifier.clone(),
        "INR",
    );

    let (a, b) = tokio::join!(extractor.extract_one(&first), extractor.extract_one(&second));
    let outcomes = [a.unwrap(), b.unwrap()];

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, ExtractionOutcome::Created(_)))
        .count();
    let deduplicated = outcomes
        .iter()
        .filter(|o| matches!(o, ExtractionOutcome::Deduplicated { .. }))
        .count();
    assert_eq!(created, 1);
    assert_eq!(deduplicated, 1);
    assert_eq!(h.stores.transactions.count().await.unwrap(), 1);

    for id in [first.id, second.id] {
        let stored = h.stores.raw_messages.find_by_id(id).await.unwrap().unwrap();
        assert!(stored.processed);
    }
}

#[tokio::test]
async fn rejected_transaction_is_not_retried_by_the_sweeper() {
    let h = harness(FakeParser::new().reply_for("AMAZON", amazon_debit()));
    let message = admitted(&h, sms("Rs.500.00 debited from A/c XX1234 at AMAZON on 15-01-26")).await;

    let extractor = Arc::new(TransactionExtractor::new(
        h.parser.clone(),
        h.stores.raw_messages.clone(),
        Arc::new(RejectingTransactions),
        h.notifier.clone(),
        "INR",
    ));

    let outcome = extractor.extract_one(&message).await.unwrap();
    assert_eq!(outcome, ExtractionOutcome::Rejected);

    let stored = h.stores.raw_messages.find_by_id(message.id).await.unwrap().unwrap();
    assert!(stored.processed);

    let sweeper = BacklogSweeper::new(
        h.stores.raw_messages.clone(),
        extractor,
        Duration::from_secs(3600),
    );
    let report = sweeper.sweep_once().await;
    assert_eq!(report.examined, 0);
    assert_eq!(h.parser.calls(), 1);
}
