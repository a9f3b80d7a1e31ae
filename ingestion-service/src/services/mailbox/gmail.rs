//! Gmail REST implementation of `Mailbox`.

use super::{MailHeader, MailMessage, Mailbox, MailboxError, MimePart};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use service_core::error::AppError;
use service_core::observability::TracedClientExt;
use std::time::Duration;
use tracing::instrument;

pub struct GmailMailbox {
    client: Client,
    api_base: String,
    user_id: String,
    access_token: String,
}

impl GmailMailbox {
    pub fn new(api_base: &str, user_id: &str, access_token: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/gmail/v1/users/{}/messages", self.api_base, self.user_id)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, MailboxError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(MailboxError::Unauthorized(format!("{}: {}", status, body)));
        }
        Err(MailboxError::Api(format!("{}: {}", status, body)))
    }
}

#[async_trait]
impl Mailbox for GmailMailbox {
    #[instrument(skip(self))]
    async fn search(
        &self,
        query: &str,
        label: &str,
        max_results: u32,
    ) -> Result<Vec<String>, MailboxError> {
        let max_results = max_results.to_string();
        let response = self
            .client
            .traced_get(&self.messages_url())
            .bearer_auth(&self.access_token)
            .query(&[
                ("q", query),
                ("labelIds", label),
                ("maxResults", max_results.as_str()),
            ])
            .send()
            .await
            .map_err(|e| MailboxError::Network(e.to_string()))?;

        let listing: ListResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| MailboxError::Decode(e.to_string()))?;

        Ok(listing.messages.into_iter().map(|m| m.id).collect())
    }

    #[instrument(skip(self))]
    async fn fetch(&self, id: &str) -> Result<MailMessage, MailboxError> {
        let url = format!("{}/{}", self.messages_url(), id);
        let response = self
            .client
            .traced_get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("format", "full")])
            .send()
            .await
            .map_err(|e| MailboxError::Network(e.to_string()))?;

        let message: MessageResource = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| MailboxError::Decode(e.to_string()))?;

        Ok(MailMessage {
            id: message.id,
            internal_date_ms: message.internal_date.and_then(|d| d.parse().ok()),
            payload: message.payload.map(Into::into).unwrap_or_default(),
        })
    }
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResource {
    id: String,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<PartResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartResource {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<HeaderResource>,
    #[serde(default)]
    body: Option<BodyResource>,
    #[serde(default)]
    parts: Vec<PartResource>,
}

#[derive(Deserialize)]
struct HeaderResource {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct BodyResource {
    #[serde(default)]
    data: Option<String>,
}

impl From<PartResource> for MimePart {
    fn from(part: PartResource) -> Self {
        MimePart {
            mime_type: part.mime_type,
            headers: part
                .headers
                .into_iter()
                .map(|h| MailHeader {
                    name: h.name,
                    value: h.value,
                })
                .collect(),
            body_data: part.body.and_then(|b| b.data),
            parts: part.parts.into_iter().map(Into::into).collect(),
        }
    }
}
