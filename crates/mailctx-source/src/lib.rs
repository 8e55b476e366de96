//! Remote mail source adapter: the abstract paginated provider contract,
//! the pagination/truncation wrapper, query construction per filter mode,
//! and extraction of normalized content from raw provider payloads.
//!
//! Transport details (OAuth, HTTP) live behind [`MailProvider`]; this crate
//! ships a fixture-backed provider so the pipeline can run and be tested
//! without network access.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{Duration, Utc};
use mailctx_core::{AttachmentRef, FilterMode, MessageContent, MessageRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "mailctx-source";

/// Provider page size cap for listing requests.
pub const PAGE_SIZE: usize = 500;
/// Limits at or above this always take the paginate-everything path.
const PAGINATE_ALL_AT: usize = 1_000;
/// Limits at or above this are treated as unlimited for the final cut.
const UNLIMITED_AT: usize = 10_000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("provider error: {0}")]
    Provider(String),
}

/// One page of a listing response.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub refs: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub email_address: String,
    pub messages_total: u64,
}

/// A single header on a raw message part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Body slot of a raw message part: inline base64url data, an attachment
/// pointer, or neither (for multipart containers).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartBody {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
}

/// Possibly-nested multipart structure as returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePart {
    pub mime_type: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: PartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

/// Full message as fetched from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    pub payload: MessagePart,
}

impl RawMessage {
    /// Convenience constructor for a single-part plain-text message.
    pub fn plain(id: &str, subject: &str, from: &str, to: &str, date: &str, body: &str) -> Self {
        Self {
            id: id.to_string(),
            thread_id: None,
            label_ids: vec!["INBOX".to_string()],
            payload: MessagePart {
                mime_type: "text/plain".to_string(),
                filename: None,
                headers: vec![
                    Header { name: "Subject".into(), value: subject.into() },
                    Header { name: "From".into(), value: from.into() },
                    Header { name: "To".into(), value: to.into() },
                    Header { name: "Date".into(), value: date.into() },
                ],
                body: PartBody {
                    data: Some(URL_SAFE.encode(body)),
                    attachment_id: None,
                },
                parts: Vec::new(),
            },
        }
    }
}

/// Abstract paginated listing + get-by-id capability. Implementations own
/// the wire format; credential acquisition happens before one of these is
/// handed to the pipeline.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_page(
        &self,
        query: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<ListPage, SourceError>;

    async fn get_message(&self, id: &str) -> Result<Option<RawMessage>, SourceError>;

    async fn profile(&self) -> Result<ProviderProfile, SourceError>;
}

/// Stable adapter over a [`MailProvider`]. Transport and provider errors
/// stop here: they are logged and collapsed into empty/absent results so a
/// single bad item can never abort a whole batch.
pub struct MailSource {
    provider: Box<dyn MailProvider>,
}

impl MailSource {
    pub fn new(provider: Box<dyn MailProvider>) -> Self {
        Self { provider }
    }

    /// List matching message refs in provider order. `limit == 0` means
    /// unlimited; large limits paginate in `PAGE_SIZE` chunks before the
    /// final truncation.
    pub async fn list(&self, query: &str, limit: usize) -> Vec<MessageRef> {
        match self.list_inner(query, limit).await {
            Ok(refs) => refs,
            Err(err) => {
                warn!(%err, query, "listing messages failed");
                Vec::new()
            }
        }
    }

    async fn list_inner(&self, query: &str, limit: usize) -> Result<Vec<MessageRef>, SourceError> {
        if limit == 0 || limit >= PAGINATE_ALL_AT {
            let mut refs = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let page = self
                    .provider
                    .list_page(query, PAGE_SIZE, token.as_deref())
                    .await?;
                refs.extend(page.refs);
                token = page.next_page_token;
                if token.is_none() || (limit > 0 && refs.len() >= limit) {
                    break;
                }
            }
            if limit > 0 && limit < UNLIMITED_AT {
                refs.truncate(limit);
            }
            Ok(refs)
        } else {
            let page = self.provider.list_page(query, limit, None).await?;
            let mut refs = page.refs;
            refs.truncate(limit);
            Ok(refs)
        }
    }

    /// Fetch one message by id. Absent or failing fetches both come back as
    /// `None` so the caller can skip-and-continue.
    pub async fn fetch(&self, id: &str) -> Option<RawMessage> {
        match self.provider.get_message(id).await {
            Ok(found) => found,
            Err(err) => {
                warn!(%err, message_id = id, "fetching message failed");
                None
            }
        }
    }

    pub async fn profile(&self) -> Option<ProviderProfile> {
        match self.provider.profile().await {
            Ok(profile) => Some(profile),
            Err(err) => {
                warn!(%err, "fetching provider profile failed");
                None
            }
        }
    }
}

/// Build the provider query string for a filter mode.
pub fn query_for(filter: &FilterMode) -> String {
    match filter {
        FilterMode::Unread => "is:unread".to_string(),
        FilterMode::All => String::new(),
        FilterMode::Folder(name) => folder_query(name),
        FilterMode::RecentDays(days) => {
            let cutoff = Utc::now() - Duration::days(*days);
            format!("after:{}", cutoff.format("%Y/%m/%d"))
        }
        FilterMode::Search(query) => query.clone(),
    }
}

fn folder_query(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "inbox" => "in:inbox".to_string(),
        "sent" => "in:sent".to_string(),
        "drafts" => "in:drafts".to_string(),
        "spam" => "in:spam".to_string(),
        "trash" => "in:trash".to_string(),
        "starred" => "is:starred".to_string(),
        "important" => "is:important".to_string(),
        _ => format!("label:{name}"),
    }
}

/// Map a provider label id to its display name; custom labels pass through.
pub fn folder_display_name(label_id: &str) -> String {
    match label_id {
        "INBOX" => "Inbox".to_string(),
        "SENT" => "Sent".to_string(),
        "DRAFT" => "Drafts".to_string(),
        "SPAM" => "Spam".to_string(),
        "TRASH" => "Trash".to_string(),
        "STARRED" => "Starred".to_string(),
        "IMPORTANT" => "Important".to_string(),
        "UNREAD" => "Unread".to_string(),
        other => other.to_string(),
    }
}

/// Extract normalized content from a raw message: case-insensitive header
/// scan plus a depth-first walk of the multipart tree.
pub fn extract(raw: &RawMessage) -> MessageContent {
    let mut content = MessageContent::default();

    for header in &raw.payload.headers {
        let value = header.value.clone();
        match header.name.to_ascii_lowercase().as_str() {
            "subject" => content.subject = value,
            "from" => content.from = value,
            "to" => content.to = value,
            "date" => content.date = value,
            _ => {}
        }
    }

    walk_part(&raw.payload, &mut content);
    content.labels = raw.label_ids.iter().map(|l| folder_display_name(l)).collect();
    content
}

fn walk_part(part: &MessagePart, content: &mut MessageContent) {
    match part.mime_type.as_str() {
        "text/plain" => content.body_text.push_str(&decode_part_data(&part.body)),
        "text/html" => content.body_html.push_str(&decode_part_data(&part.body)),
        _ if !part.parts.is_empty() => {
            for sub in &part.parts {
                walk_part(sub, content);
            }
        }
        _ => {
            if let Some(attachment_id) = &part.body.attachment_id {
                content.attachments.push(AttachmentRef {
                    filename: part
                        .filename
                        .clone()
                        .filter(|f| !f.is_empty())
                        .unwrap_or_else(|| "unknown".to_string()),
                    mime_type: part.mime_type.clone(),
                    attachment_id: attachment_id.clone(),
                });
            }
        }
    }
}

fn decode_part_data(body: &PartBody) -> String {
    let Some(data) = &body.data else {
        return String::new();
    };
    let trimmed = data.trim();
    let bytes = URL_SAFE
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed));
    match bytes {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => {
            warn!(%err, "undecodable part body, skipping");
            String::new()
        }
    }
}

/// Serialized mailbox snapshot consumed by [`FixtureProvider::from_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxFixture {
    pub email_address: String,
    pub messages: Vec<RawMessage>,
}

/// Deterministic in-memory provider backed by a fixture mailbox. Used by
/// tests and by accounts whose mailbox is a local snapshot; supports
/// injected failures for skip-and-continue coverage.
#[derive(Default)]
pub struct FixtureProvider {
    email_address: String,
    refs: Vec<MessageRef>,
    messages: HashMap<String, RawMessage>,
    fail_fetch: HashSet<String>,
    fail_listing: bool,
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self {
            email_address: "fixture@example.com".to_string(),
            ..Self::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading mailbox fixture {}", path.display()))?;
        let fixture: MailboxFixture = serde_json::from_str(&text)
            .with_context(|| format!("parsing mailbox fixture {}", path.display()))?;
        let mut provider = Self::new();
        provider.email_address = fixture.email_address;
        for message in fixture.messages {
            provider.push(message);
        }
        Ok(provider)
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email_address = email.to_string();
        self
    }

    /// Add a message; it becomes listable and fetchable.
    pub fn push(&mut self, message: RawMessage) {
        self.refs.push(MessageRef {
            id: message.id.clone(),
            thread_id: message.thread_id.clone(),
        });
        self.messages.insert(message.id.clone(), message);
    }

    /// Add a listing-only ref whose fetch reports not-found, like a message
    /// deleted between listing and processing.
    pub fn push_ref(&mut self, id: &str) {
        self.refs.push(MessageRef {
            id: id.to_string(),
            thread_id: None,
        });
    }

    /// Make fetches for `id` fail with a provider error.
    pub fn fail_fetch(&mut self, id: &str) {
        self.fail_fetch.insert(id.to_string());
    }

    pub fn fail_listing(&mut self) {
        self.fail_listing = true;
    }
}

#[async_trait]
impl MailProvider for FixtureProvider {
    async fn list_page(
        &self,
        _query: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<ListPage, SourceError> {
        if self.fail_listing {
            return Err(SourceError::Provider("listing unavailable".to_string()));
        }
        let offset: usize = page_token
            .map(|t| t.parse().map_err(|_| SourceError::Provider(format!("bad page token {t}"))))
            .transpose()?
            .unwrap_or(0);
        let end = (offset + page_size.max(1)).min(self.refs.len());
        let refs = self.refs[offset.min(self.refs.len())..end].to_vec();
        let next_page_token = (end < self.refs.len()).then(|| end.to_string());
        Ok(ListPage { refs, next_page_token })
    }

    async fn get_message(&self, id: &str) -> Result<Option<RawMessage>, SourceError> {
        if self.fail_fetch.contains(id) {
            return Err(SourceError::Provider(format!("backend error for {id}")));
        }
        Ok(self.messages.get(id).cloned())
    }

    async fn profile(&self) -> Result<ProviderProfile, SourceError> {
        Ok(ProviderProfile {
            email_address: self.email_address.clone(),
            messages_total: self.refs.len() as u64,
        })
    }
}
