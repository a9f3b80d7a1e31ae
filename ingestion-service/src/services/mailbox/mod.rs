//! Remote mailbox access.

pub mod gmail;
pub mod mime;

pub use gmail::GmailMailbox;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("Mailbox rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Mailbox API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to decode mailbox response: {0}")]
    Decode(String),
}

/// One header of a MIME part.
#[derive(Debug, Clone, PartialEq)]
pub struct MailHeader {
    pub name: String,
    pub value: String,
}

/// A node in the MIME tree. `body_data` is base64url, as delivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MimePart {
    pub mime_type: String,
    pub headers: Vec<MailHeader>,
    pub body_data: Option<String>,
    pub parts: Vec<MimePart>,
}

impl MimePart {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// A fetched message.
#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub id: String,
    /// Provider-assigned receive time, epoch milliseconds.
    pub internal_date_ms: Option<i64>,
    pub payload: MimePart,
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Ids of messages matching `query` under `label`, at most `max_results`.
    async fn search(
        &self,
        query: &str,
        label: &str,
        max_results: u32,
    ) -> Result<Vec<String>, MailboxError>;

    async fn fetch(&self, id: &str) -> Result<MailMessage, MailboxError>;
}
