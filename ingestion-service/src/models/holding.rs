//! Investment ledger entries and the per-instrument holding aggregate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentType {
    Stock,
    MutualFund,
}

impl InstrumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Stock => "STOCK",
            InstrumentType::MutualFund => "MUTUAL_FUND",
        }
    }
}

impl std::str::FromStr for InstrumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STOCK" => Ok(InstrumentType::Stock),
            "MUTUAL_FUND" => Ok(InstrumentType::MutualFund),
            _ => Err(format!("Unknown instrument type: {}", s)),
        }
    }
}

/// Direction of an investment event: `Sip` is a buy, `Redemption` a sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Sip,
    Redemption,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Sip => "SIP",
            EntryType::Redemption => "REDEMPTION",
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, EntryType::Sip)
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIP" => Ok(EntryType::Sip),
            "REDEMPTION" => Ok(EntryType::Redemption),
            _ => Err(format!("Unknown ledger entry type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub raw_message_id: Uuid,
    pub entry_type: EntryType,
    pub instrument_type: InstrumentType,
    pub symbol: Option<String>,
    pub name: String,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub currency: String,
    pub ledger_date: DateTime<Utc>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub raw_message_id: Uuid,
    pub entry_type: EntryType,
    pub instrument_type: InstrumentType,
    pub symbol: Option<String>,
    pub name: String,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub currency: String,
    pub ledger_date: DateTime<Utc>,
    pub description: String,
}

impl NewLedgerEntry {
    pub fn into_entry(self, id: Uuid, now: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id,
            raw_message_id: self.raw_message_id,
            entry_type: self.entry_type,
            instrument_type: self.instrument_type,
            symbol: self.symbol,
            name: self.name,
            quantity: self.quantity,
            price: self.price,
            amount: self.amount,
            currency: self.currency,
            ledger_date: self.ledger_date,
            description: self.description,
            created_at: now,
        }
    }
}

/// Running position for one instrument, keyed by `(instrument_type, symbol)`.
/// An instrument without a symbol is keyed by its name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingAggregate {
    pub id: Uuid,
    pub instrument_type: InstrumentType,
    pub symbol: String,
    pub name: String,
    pub quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub current_value: Option<Decimal>,
    pub currency: String,
    pub last_raw_message_id: Uuid,
    pub last_updated: DateTime<Utc>,
}

/// A buy observation to fold into the aggregate.
#[derive(Debug, Clone)]
pub struct HoldingUpdate {
    pub instrument_type: InstrumentType,
    pub symbol: Option<String>,
    pub name: String,
    pub quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub current_value: Option<Decimal>,
    pub currency: String,
    pub raw_message_id: Uuid,
}

impl HoldingUpdate {
    /// Aggregate key: the symbol, else the (possibly empty) name.
    pub fn key_symbol(&self) -> &str {
        self.symbol.as_deref().unwrap_or(&self.name)
    }

    /// Applies this buy to `existing`, or starts a new aggregate.
    ///
    /// Quantity accumulates; price, value and name are overwritten only when
    /// this observation carries them.
    pub fn apply(self, existing: Option<HoldingAggregate>, now: DateTime<Utc>) -> HoldingAggregate {
        match existing {
            Some(mut holding) => {
                holding.quantity += self.quantity;
                if self.average_price.is_some() {
                    holding.average_price = self.average_price;
                }
                if self.current_value.is_some() {
                    holding.current_value = self.current_value;
                }
                if !self.name.is_empty() {
                    holding.name = self.name;
                }
                holding.last_raw_message_id = self.raw_message_id;
                holding.last_updated = now;
                holding
            }
            None => HoldingAggregate {
                id: Uuid::new_v4(),
                instrument_type: self.instrument_type,
                symbol: self.key_symbol().to_string(),
                name: self.name,
                quantity: self.quantity,
                average_price: self.average_price,
                current_value: self.current_value,
                currency: self.currency,
                last_raw_message_id: self.raw_message_id,
                last_updated: now,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn update(qty: &str, price: Option<&str>) -> HoldingUpdate {
        HoldingUpdate {
            instrument_type: InstrumentType::MutualFund,
            symbol: Some("XYZ Fund".to_string()),
            name: "XYZ Fund".to_string(),
            quantity: Decimal::from_str(qty).unwrap(),
            average_price: price.map(|p| Decimal::from_str(p).unwrap()),
            current_value: None,
            currency: "INR".to_string(),
            raw_message_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn apply_accumulates_quantity_and_keeps_known_price() {
        let now = Utc::now();
        let first = update("10.5", Some("42.10")).apply(None, now);
        let second = update("5", None).apply(Some(first.clone()), now);

        assert_eq!(second.id, first.id);
        assert_eq!(second.quantity, Decimal::from_str("15.5").unwrap());
        assert_eq!(second.average_price, Some(Decimal::from_str("42.10").unwrap()));
    }

    #[test]
    fn missing_symbol_keys_on_the_name() {
        let mut u = update("1", None);
        u.symbol = None;
        u.name = format!("{} Direct Growth", "Long Horizon Balanced Advantage Fund ".repeat(2));
        assert_eq!(u.key_symbol(), u.name);

        u.name = String::new();
        assert_eq!(u.key_symbol(), "");
        assert_eq!(u.apply(None, Utc::now()).symbol, "");
    }
}
