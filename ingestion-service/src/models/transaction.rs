//! Financial transaction model and its dedupe fingerprint.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Debit,
    Credit,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Debit => "DEBIT",
            TransactionType::Credit => "CREDIT",
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEBIT" => Ok(TransactionType::Debit),
            "CREDIT" => Ok(TransactionType::Credit),
            other => Err(format!("Unknown transaction type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub raw_message_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub merchant_name: Option<String>,
    pub category: Option<String>,
    pub transaction_type: TransactionType,
    pub transaction_date: DateTime<Utc>,
    pub description: Option<String>,
    pub dedupe_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub raw_message_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub merchant_name: Option<String>,
    pub category: Option<String>,
    pub transaction_type: TransactionType,
    pub transaction_date: DateTime<Utc>,
    pub description: Option<String>,
    pub dedupe_key: String,
}

impl NewTransaction {
    pub fn into_transaction(self, id: Uuid, now: DateTime<Utc>) -> Transaction {
        Transaction {
            id,
            raw_message_id: self.raw_message_id,
            amount: self.amount,
            currency: self.currency,
            merchant_name: self.merchant_name,
            category: self.category,
            transaction_type: self.transaction_type,
            transaction_date: self.transaction_date,
            description: self.description,
            dedupe_key: self.dedupe_key,
            created_at: now,
        }
    }
}

/// Channel-independent fingerprint of a transaction.
///
/// SHA-256 (lowercase hex) over
/// `amount|currency|TYPE|yyyy-MM-dd|MERCHANT`, where the amount has trailing
/// zeros stripped and the merchant is trimmed, uppercased and has its
/// whitespace runs collapsed to single spaces. A missing merchant hashes as
/// the empty string.
pub fn dedupe_key(
    amount: Decimal,
    currency: &str,
    transaction_type: TransactionType,
    date: DateTime<Utc>,
    merchant: Option<&str>,
) -> String {
    let merchant = merchant
        .map(|m| {
            m.split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_uppercase()
        })
        .unwrap_or_default();

    let payload = format!(
        "{}|{}|{}|{}|{}",
        amount.normalize(),
        currency,
        transaction_type.as_str(),
        date.format("%Y-%m-%d"),
        merchant
    );

    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Inclusive window searched for an existing fingerprint: seven days before
/// the transaction date through one day after.
pub fn dedupe_window(date: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (date - Duration::days(7), date + Duration::days(1))
}
