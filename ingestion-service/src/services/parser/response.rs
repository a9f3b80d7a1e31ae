//! Sanitization of free-form model output into a `ParsedTransaction`.
//!
//! Model replies are untrusted text. A reply is accepted only when it reduces
//! to a single flat JSON object carrying `amount` and `transactionType`.

use super::{ParsedTransaction, ParserError};
use crate::models::TransactionType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;

const FENCE: &str = "```";

/// Amounts must fit the stored precision, NUMERIC(19, 4).
const AMOUNT_LIMIT: i64 = 1_000_000_000_000_000;

/// Removes a surrounding markdown code fence (with optional language tag).
/// Text that does not start with a fence is returned trimmed.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix(FENCE) else {
        return trimmed;
    };

    // Drop the info string (e.g. "json") up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };

    match body.rfind(FENCE) {
        Some(idx) => body[..idx].trim(),
        None => body.trim(),
    }
}

/// Returns the first balanced `{...}` block of `content`.
///
/// Braces inside JSON string literals are ignored. When the object never
/// closes, everything from the first `{` onward is returned and left for the
/// JSON parser to reject.
pub fn extract_first_object(content: &str) -> Option<&str> {
    let text = strip_code_fences(content);
    let start = text.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    Some(&text[start..])
}

/// Parses `candidate` and checks it is a flat object with the required keys.
///
/// `amount` must be a number or a string, `transactionType` a string, and no
/// value may be an object or an array.
pub fn validate_flat_schema(candidate: &str) -> Result<Map<String, Value>, ParserError> {
    let candidate = candidate.trim();
    if !candidate.starts_with('{') || !candidate.ends_with('}') || !candidate.contains('"') {
        return Err(ParserError::MalformedResponse(
            "reply is not a JSON object".to_string(),
        ));
    }

    let value: Value = serde_json::from_str(candidate)
        .map_err(|e| ParserError::MalformedResponse(format!("invalid JSON: {}", e)))?;

    let Value::Object(map) = value else {
        return Err(ParserError::MalformedResponse(
            "reply is not a JSON object".to_string(),
        ));
    };

    match map.get("amount") {
        Some(Value::Number(_)) | Some(Value::String(_)) => {}
        Some(_) => {
            return Err(ParserError::MalformedResponse(
                "amount must be a number or a string".to_string(),
            ))
        }
        None => {
            return Err(ParserError::MalformedResponse(
                "missing required field amount".to_string(),
            ))
        }
    }

    match map.get("transactionType") {
        Some(Value::String(_)) => {}
        Some(_) => {
            return Err(ParserError::MalformedResponse(
                "transactionType must be a string".to_string(),
            ))
        }
        None => {
            return Err(ParserError::MalformedResponse(
                "missing required field transactionType".to_string(),
            ))
        }
    }

    if let Some((key, _)) = map
        .iter()
        .find(|(_, v)| matches!(v, Value::Object(_) | Value::Array(_)))
    {
        return Err(ParserError::MalformedResponse(format!(
            "field {} is not a scalar",
            key
        )));
    }

    Ok(map)
}

/// Maps a validated object onto the domain result.
///
/// `transactionType` of `NONE` and non-positive amounts mean "not a
/// transaction" and yield `Ok(None)`.
pub fn into_parsed(map: &Map<String, Value>) -> Result<Option<ParsedTransaction>, ParserError> {
    let raw_type = text_field(map, "transactionType").unwrap_or_default();
    let raw_type = raw_type.trim().to_uppercase();
    if raw_type == "NONE" {
        return Ok(None);
    }

    let amount = match map.get("amount") {
        Some(Value::Number(n)) => parse_decimal(&n.to_string()),
        Some(Value::String(s)) => parse_decimal(s),
        _ => None,
    }
    .ok_or_else(|| ParserError::MalformedResponse("amount is not a decimal".to_string()))?;

    if amount <= Decimal::ZERO {
        return Ok(None);
    }
    if amount >= Decimal::from(AMOUNT_LIMIT) {
        return Err(ParserError::MalformedResponse(format!(
            "amount {} is out of range",
            amount
        )));
    }

    let transaction_type = TransactionType::from_str(&raw_type)
        .map_err(ParserError::MalformedResponse)?;

    Ok(Some(ParsedTransaction {
        amount,
        currency: text_field(map, "currency").and_then(|c| currency_code(&c)),
        merchant_name: text_field(map, "merchantName"),
        category: text_field(map, "category"),
        transaction_type,
        transaction_date: text_field(map, "transactionDate").and_then(|d| parse_date(&d)),
        description: text_field(map, "description"),
    }))
}

/// Full pipeline from reply text to domain result.
pub fn interpret(content: &str) -> Result<Option<ParsedTransaction>, ParserError> {
    if content.trim().is_empty() {
        return Err(ParserError::EmptyResponse);
    }
    let candidate = extract_first_object(content).ok_or_else(|| {
        ParserError::MalformedResponse("no JSON object in reply".to_string())
    })?;
    let map = validate_flat_schema(candidate)?;
    into_parsed(&map)
}

fn text_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// ISO 4217 style three-letter code; anything else falls back to the default.
fn currency_code(raw: &str) -> Option<String> {
    let code = raw.trim();
    (code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()))
        .then(|| code.to_ascii_uppercase())
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
