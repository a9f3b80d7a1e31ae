//! Pattern-based extraction of investment events from message text.
//!
//! Every pattern is applied independently, so one message can yield several
//! ledger entries. Buys are folded into the holding aggregate for their
//! instrument; sells only produce a ledger entry.

use crate::models::{
    EntryType, HoldingUpdate, InstrumentType, LedgerEntry, NewLedgerEntry, RawMessage,
};
use crate::services::store::{HoldingStore, LedgerStore};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

const SYMBOL_MAX_CHARS: usize = 50;
const NAME_MAX_CHARS: usize = 100;

static PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // "purchased 10.5 units of XYZ Fund", "sold 20 shares INFY at 1500"
        r"(?i)\b(?:purchased|bought|sip|redeemed|sold)\s+([\d.,]+)\s+(?:units?|shares?)\s+(?:of\s+)?([A-Za-z0-9][A-Za-z0-9\s]*?)(?:\s+at\b|\s+for\b|\s+@|\s+on\b|\s+via\b|[.,;:()]|$)",
        // "Units allotted: 45.12 in ABC Bluechip Fund"
        r"(?i)\b(?:units?|shares?)\s+(?:credited|allotted|purchased|bought)\s*:\s*([\d.,]+)\s+(?:(?:of|in|for)\s+)?([A-Za-z0-9][A-Za-z0-9\s]*?)(?:\s+at\b|\s+for\b|\s+on\b|[.,;:()]|$)",
        // "50 shares RELIANCE have been credited": the name must be capitalized
        r"([\d.,]+)\s+(?i:units?|shares?)\s+([A-Z][A-Za-z0-9&\-]*(?:\s+[A-Z0-9][A-Za-z0-9&\-]*)*)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid holdings pattern"))
    .collect()
});

static SELL_CUES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:sold|sell|redeemed|redemption)\b").expect("valid sell pattern"));

static FUND_CUES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:mutual\s+fund|fund|mf|sip|nav|folio)\b").expect("valid fund pattern")
});

static STOCK_CUES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:shares?|stocks?|equity|nse|bse|demat)\b").expect("valid stock pattern")
});

/// One recognized investment event.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingMatch {
    pub entry_type: EntryType,
    pub instrument_type: InstrumentType,
    pub name: String,
    pub symbol: Option<String>,
    pub quantity: Decimal,
}

/// Fund cues win over stock cues; with neither, a mutual fund is assumed.
pub fn infer_instrument_type(text: &str) -> InstrumentType {
    if FUND_CUES.is_match(text) {
        InstrumentType::MutualFund
    } else if STOCK_CUES.is_match(text) {
        InstrumentType::Stock
    } else {
        InstrumentType::MutualFund
    }
}

fn parse_quantity(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    let cleaned = cleaned.trim_matches('.');
    Decimal::from_str(cleaned).ok().filter(|q| *q > Decimal::ZERO)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect::<String>().trim_end().to_string()
}

/// Applies every pattern to `body`.
///
/// A match is a sell when the text between the previous match of the same
/// pattern and this match's quantity carries a sell or redeem cue.
pub fn find_matches(body: &str) -> Vec<HoldingMatch> {
    let instrument_type = infer_instrument_type(body);
    let mut matches = Vec::new();

    for pattern in PATTERNS.iter() {
        let mut context_start = 0;

        for caps in pattern.captures_iter(body) {
            let (Some(qty), Some(name)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let whole_end = caps.get(0).map(|m| m.end()).unwrap_or(qty.end());
            let context = &body[context_start..qty.start()];
            context_start = whole_end;

            let Some(quantity) = parse_quantity(qty.as_str()) else {
                tracing::debug!(raw = qty.as_str(), "Skipping match with unreadable quantity");
                continue;
            };

            let name = name.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                continue;
            }
            let name = truncate(&name, NAME_MAX_CHARS);

            let entry_type = if SELL_CUES.is_match(context) {
                EntryType::Redemption
            } else {
                EntryType::Sip
            };

            matches.push(HoldingMatch {
                entry_type,
                instrument_type,
                symbol: (name.chars().count() <= SYMBOL_MAX_CHARS).then(|| name.clone()),
                name,
                quantity,
            });
        }
    }

    matches
}

pub struct HoldingsExtractor {
    ledger: Arc<dyn LedgerStore>,
    holdings: Arc<dyn HoldingStore>,
    default_currency: String,
}

impl HoldingsExtractor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        holdings: Arc<dyn HoldingStore>,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            holdings,
            default_currency: default_currency.into(),
        }
    }

    /// Writes a ledger entry per match and folds buys into their aggregate.
    /// A failing match is logged and does not stop the others.
    #[instrument(skip(self, message), fields(raw_message_id = %message.id, source = %message.source))]
    pub async fn extract(&self, message: &RawMessage) -> Vec<LedgerEntry> {
        let mut written = Vec::new();

        for found in find_matches(&message.body) {
            let entry = NewLedgerEntry {
                raw_message_id: message.id,
                entry_type: found.entry_type,
                instrument_type: found.instrument_type,
                symbol: found.symbol.clone(),
                name: found.name.clone(),
                quantity: found.quantity,
                price: None,
                amount: Decimal::ZERO,
                currency: self.default_currency.clone(),
                ledger_date: message.received_at,
                description: format!("Parsed from {}", message.source),
            };

            let entry = match self.ledger.insert(entry).await {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, name = %found.name, "Failed to record ledger entry");
                    continue;
                }
            };

            metrics::counter!("holdings_ledger_entries_total", "entry_type" => entry.entry_type.as_str())
                .increment(1);

            if found.entry_type.is_buy() {
                let update = HoldingUpdate {
                    instrument_type: found.instrument_type,
                    symbol: found.symbol,
                    name: found.name,
                    quantity: found.quantity,
                    average_price: None,
                    current_value: None,
                    currency: self.default_currency.clone(),
                    raw_message_id: message.id,
                };
                if let Err(e) = self.holdings.upsert_buy(update).await {
                    tracing::warn!(error = %e, ledger_entry_id = %entry.id, "Failed to update holding");
                }
            }

            tracing::info!(
                ledger_entry_id = %entry.id,
                entry_type = entry.entry_type.as_str(),
                quantity = %entry.quantity,
                "Investment event recorded"
            );
            written.push(entry);
        }

        written
    }
}
