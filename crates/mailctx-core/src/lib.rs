//! Core domain model for mailctx: message references, extracted message
//! content, persisted context artifacts, and resumable checkpoint state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mailctx-core";

/// Type tag carried by every persisted mail artifact.
pub const ARTIFACT_TYPE_MAIL: &str = "mail";

/// Identifies a listable remote message without its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// Pointer to an attachment inside a fetched message. The download URL is
/// derivable from the message and attachment ids; the blob itself is never
/// fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub mime_type: String,
    pub attachment_id: String,
}

impl AttachmentRef {
    pub fn download_url(&self, message_id: &str) -> String {
        format!(
            "https://mail.example.com/v1/users/me/messages/{}/attachments/{}",
            message_id, self.attachment_id
        )
    }
}

/// Attachment entry as persisted inside an artifact's metadata block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAttachment {
    pub filename: String,
    pub mime_type: String,
    pub attachment_id: String,
    pub download_url: String,
}

impl StoredAttachment {
    pub fn from_ref(att: &AttachmentRef, message_id: &str) -> Self {
        Self {
            filename: att.filename.clone(),
            mime_type: att.mime_type.clone(),
            attachment_id: att.attachment_id.clone(),
            download_url: att.download_url(message_id),
        }
    }
}

/// Normalized content extracted from one fetched message. Immutable once
/// built; the `date` field keeps the provider's raw header string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: String,
    pub body_text: String,
    pub body_html: String,
    pub attachments: Vec<AttachmentRef>,
    pub labels: Vec<String>,
}

impl MessageContent {
    /// Preferred body rendering: plain text when present, html otherwise.
    pub fn body(&self) -> &str {
        if self.body_text.is_empty() {
            &self.body_html
        } else {
            &self.body_text
        }
    }
}

/// Which messages a sync run targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Unread,
    All,
    Folder(String),
    RecentDays(i64),
    Search(String),
}

impl Default for FilterMode {
    fn default() -> Self {
        Self::Unread
    }
}

/// The parameters that affect *what* a run fetches and processes. This is
/// the checkpoint fingerprint input; display-only settings (progress bar,
/// resume confirmation) deliberately have no field here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchParams {
    pub account: Option<String>,
    pub filter: FilterMode,
    pub limit: usize,
    pub create_context: bool,
}

/// Full metadata block persisted with every artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMetadata {
    pub account: String,
    pub message_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub folder: String,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub attachments: Vec<StoredAttachment>,
}

/// The persisted normalized record derived from one remote message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextArtifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub folder: String,
    pub display_name: String,
    /// ISO-8601 timestamp derived from the message date (or wall clock on
    /// parse failure).
    pub recorded_at: String,
    /// Free-text rendering combining metadata, body, and attachment list.
    pub rendering: String,
    pub metadata: MailMetadata,
}

impl ContextArtifact {
    pub fn identity_key(&self) -> &str {
        &self.metadata.message_id
    }
}

/// Resumable cursor plus running counts, one per storage root. A run whose
/// fingerprint differs ignores any stored checkpoint rather than merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub fingerprint: String,
    pub saved_at: DateTime<Utc>,
    pub processed: usize,
    pub total: usize,
    pub created: usize,
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_prefers_plain_text_over_html() {
        let mut content = MessageContent {
            body_text: "plain".into(),
            body_html: "<p>html</p>".into(),
            ..MessageContent::default()
        };
        assert_eq!(content.body(), "plain");
        content.body_text.clear();
        assert_eq!(content.body(), "<p>html</p>");
    }

    #[test]
    fn download_url_derives_from_message_and_attachment_ids() {
        let att = AttachmentRef {
            filename: "report.pdf".into(),
            mime_type: "application/pdf".into(),
            attachment_id: "att-9".into(),
        };
        let url = att.download_url("msg-1");
        assert!(url.ends_with("/messages/msg-1/attachments/att-9"));
    }
}
