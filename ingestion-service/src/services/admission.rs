//! Cheap pre-filter deciding whether a message is worth extracting.

use once_cell::sync::Lazy;
use regex::Regex;

static FINANCE_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:debit|debited|credit|credited|transferred|transfer|withdrawn|withdrawal|deposited|paid|payment|spent|received|refund(?:ed)?|upi|neft|imps|rtgs|txn|transaction|a/c|acct|inr|rs|purchased|bought|sip|nav|units?|shares?|stocks?|equity|redeemed|redemption|allotted)\b",
    )
    .expect("valid finance pattern")
});

static PROMO_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:unsubscribe|promotion|promotional|promo|offers?|newsletter|discount|coupon|limited time)\b",
    )
    .expect("valid promo pattern")
});

/// A message is admissible when it names at least one finance term, names no
/// promotional term and contains at least one digit.
pub fn is_admissible(body: &str) -> bool {
    if !body.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }
    let has_finance = FINANCE_TERMS.is_match(body) || body.contains('₹');
    has_finance && !PROMO_TERMS.is_match(body)
}
