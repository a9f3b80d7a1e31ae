//! Body extraction from a MIME tree.

use super::MimePart;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid tag pattern"));

/// Decodes base64url body data, with or without padding.
pub fn decode_body(data: &str) -> Option<String> {
    let data = data.trim();
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(data))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Replaces tags with spaces, decodes the common entities and collapses
/// whitespace.
pub fn strip_html(html: &str) -> String {
    let text = TAG.replace_all(html, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Best textual body of a message.
///
/// Direct body data on the root wins. Otherwise the first `text/plain` part
/// anywhere in the tree, then the first `text/html` part with markup
/// removed. Returns an empty string when nothing decodes.
pub fn extract_body(payload: &MimePart) -> String {
    if let Some(text) = payload
        .body_data
        .as_deref()
        .filter(|d| !d.is_empty())
        .and_then(decode_body)
    {
        if payload.mime_type.eq_ignore_ascii_case("text/html") {
            return strip_html(&text);
        }
        return text;
    }

    if let Some(text) = find_part(payload, "text/plain") {
        return text;
    }

    find_part(payload, "text/html")
        .map(|html| strip_html(&html))
        .unwrap_or_default()
}

fn find_part(part: &MimePart, mime_type: &str) -> Option<String> {
    for child in &part.parts {
        if child.mime_type.eq_ignore_ascii_case(mime_type) {
            if let Some(text) = child
                .body_data
                .as_deref()
                .filter(|d| !d.is_empty())
                .and_then(decode_body)
            {
                return Some(text);
            }
        }
        if let Some(text) = find_part(child, mime_type) {
            return Some(text);
        }
    }
    None
}

/// Text handed to ingestion: `[Subject: <subject>] <body>`, or the body
/// alone when there is no subject.
pub fn composite_body(subject: Option<&str>, body: &str) -> String {
    match subject.map(str::trim).filter(|s| !s.is_empty()) {
        Some(subject) => format!("[Subject: {}] {}", subject, body.trim()),
        None => body.trim().to_string(),
    }
}
