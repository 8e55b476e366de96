//! Storage-root operations for mailctx: the identity dedup index, the
//! collision-checked artifact writer, and the fingerprinted checkpoint
//! store. All writes are atomic (uuid-named temp file + rename) so a reader
//! never observes a partially-written record.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use mailctx_core::{
    Checkpoint, ContextArtifact, FetchParams, MailMetadata, MessageContent, StoredAttachment,
    ARTIFACT_TYPE_MAIL,
};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mailctx-store";

/// Artifact slot naming: `context-<YYYYMMDDHHMMSS>.json`.
pub const ARTIFACT_PREFIX: &str = "context-";
pub const ARTIFACT_EXT: &str = "json";
/// Well-known checkpoint file name, distinct from any artifact slot.
pub const CHECKPOINT_FILE: &str = "ingest-state.json";

/// Date formats carrying an explicit zone offset, tried first.
const ZONED_FORMATS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M:%S %z",
    "%Y-%m-%d %H:%M:%S %z",
];

/// Zone-less formats, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%a, %d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
];

/// Parse a message date header against the known format list. A trailing
/// parenthesized zone comment ("... +0000 (UTC)") is stripped before any
/// format is attempted. Returns `None` when every format fails.
pub fn parse_message_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    let cleaned = match raw.find('(') {
        Some(idx) => raw[..idx].trim(),
        None => raw.trim(),
    };
    for format in ZONED_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(cleaned, format) {
            return Some(parsed);
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(cleaned, format) {
            return Some(parsed.and_utc().fixed_offset());
        }
    }
    None
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "renaming temp file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

fn is_artifact_file_name(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX) && name.ends_with(&format!(".{ARTIFACT_EXT}"))
}

/// In-memory identity index over the artifacts in one storage root. Built
/// once at startup and maintained on every write, instead of re-scanning
/// the directory per lookup. Reads artifacts, never writes them.
#[derive(Debug, Default)]
pub struct DedupIndex {
    keys: HashSet<String>,
}

impl DedupIndex {
    /// Scan a storage root for mail artifacts and collect their identity
    /// keys. Malformed or partially-written files are skipped, not fatal.
    pub async fn scan(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut index = Self::default();
        if !fs::try_exists(root)
            .await
            .with_context(|| format!("checking storage root {}", root.display()))?
        {
            return Ok(index);
        }

        let mut entries = fs::read_dir(root)
            .await
            .with_context(|| format!("reading storage root {}", root.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("iterating storage root {}", root.display()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_artifact_file_name(&name) {
                continue;
            }
            let Ok(text) = fs::read_to_string(entry.path()).await else {
                debug!(file = %name, "unreadable artifact file, skipping");
                continue;
            };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                debug!(file = %name, "malformed artifact file, skipping");
                continue;
            };
            if value.get("type").and_then(|v| v.as_str()) != Some(ARTIFACT_TYPE_MAIL) {
                continue;
            }
            if let Some(id) = value
                .pointer("/metadata/message_id")
                .and_then(|v| v.as_str())
            {
                index.keys.insert(id.to_string());
            }
        }
        Ok(index)
    }

    pub fn contains(&self, identity_key: &str) -> bool {
        self.keys.contains(identity_key)
    }

    pub fn insert(&mut self, identity_key: String) {
        self.keys.insert(identity_key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Result of one artifact write attempt.
#[derive(Debug)]
pub enum WriteOutcome {
    Created {
        path: PathBuf,
        artifact: Box<ContextArtifact>,
    },
    /// A slot with the derived timestamp name already exists. The item is
    /// dropped, not merged or suffixed.
    SlotOccupied { path: PathBuf },
}

/// Converts one fetched message into a context artifact and persists it
/// under a deterministically-named slot. Owns naming and collision
/// avoidance; identity dedup happens in [`DedupIndex`] before calling in.
#[derive(Debug, Clone)]
pub struct ContextWriter {
    root: PathBuf,
}

impl ContextWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write(
        &self,
        account: &str,
        message_id: &str,
        thread_id: Option<&str>,
        content: &MessageContent,
    ) -> Result<WriteOutcome> {
        let recorded = match parse_message_date(&content.date) {
            Some(parsed) => parsed,
            None => {
                warn!(date = %content.date, "unparseable message date, falling back to current time");
                Utc::now().fixed_offset()
            }
        };
        let token = recorded.format("%Y%m%d%H%M%S").to_string();
        let slot = format!("{ARTIFACT_PREFIX}{token}.{ARTIFACT_EXT}");
        let path = self.root.join(&slot);

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking artifact slot {}", path.display()))?
        {
            debug!(slot = %slot, "artifact slot already occupied");
            return Ok(WriteOutcome::SlotOccupied { path });
        }

        let folder = content
            .labels
            .first()
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string());
        let attachments: Vec<StoredAttachment> = content
            .attachments
            .iter()
            .map(|att| StoredAttachment::from_ref(att, message_id))
            .collect();
        let artifact = ContextArtifact {
            kind: ARTIFACT_TYPE_MAIL.to_string(),
            folder: folder.clone(),
            display_name: display_name(account, &content.from, &content.subject),
            recorded_at: recorded.to_rfc3339(),
            rendering: render(account, content, &folder),
            metadata: MailMetadata {
                account: account.to_string(),
                message_id: message_id.to_string(),
                thread_id: thread_id.map(str::to_string),
                from: content.from.clone(),
                to: content.to.clone(),
                subject: content.subject.clone(),
                date: content.date.clone(),
                folder,
                labels: content.labels.clone(),
                has_attachments: !attachments.is_empty(),
                attachments,
            },
        };

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating storage root {}", self.root.display()))?;
        let bytes = serde_json::to_vec_pretty(&artifact).context("serializing artifact")?;
        write_atomic(&path, &bytes).await?;
        Ok(WriteOutcome::Created {
            path,
            artifact: Box::new(artifact),
        })
    }
}

/// Synthesized display name: `mail_<account>_<clean-sender>_<subject-prefix>`.
fn display_name(account: &str, from: &str, subject: &str) -> String {
    let sender_name = if let Some((name, _)) = from.split_once('<') {
        name.trim().trim_matches('"').to_string()
    } else if let Some((local, _)) = from.split_once('@') {
        local.to_string()
    } else {
        from.to_string()
    };
    let clean_sender = sender_name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .collect::<String>()
        .trim()
        .replace(' ', "_")
        .to_lowercase();
    let subject_prefix = subject
        .chars()
        .take(30)
        .collect::<String>()
        .replace(' ', "_")
        .to_lowercase();
    format!("mail_{account}_{clean_sender}_{subject_prefix}")
}

fn render(account: &str, content: &MessageContent, folder: &str) -> String {
    let mut out = format!(
        "MESSAGE METADATA:\nAccount: {account}\nFrom: {}\nTo: {}\nSubject: {}\nDate: {}\nFolder: {folder}\nLabels: {}\n\nMESSAGE CONTENT:\n{}",
        content.from,
        content.to,
        content.subject,
        content.date,
        content.labels.join(", "),
        content.body(),
    );
    if !content.attachments.is_empty() {
        out.push_str(&format!("\n\nATTACHMENTS ({}):\n", content.attachments.len()));
        for att in &content.attachments {
            out.push_str(&format!("- {} ({})\n", att.filename, att.mime_type));
        }
    }
    out
}

/// Persists and loads the single resumable checkpoint for a storage root.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    /// Deterministic hash over the fetch-affecting parameters. Key order
    /// cannot influence the result: the canonical JSON rendering sorts
    /// object keys.
    pub fn fingerprint(params: &FetchParams) -> String {
        let value = serde_json::to_value(params).expect("FetchParams serializes");
        fingerprint_value(&value)
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating storage root {}", self.root.display()))?;
        let bytes = serde_json::to_vec_pretty(checkpoint).context("serializing checkpoint")?;
        write_atomic(&self.path(), &bytes).await
    }

    /// Load the stored checkpoint if its fingerprint matches. A stale or
    /// unreadable checkpoint is ignored, not deleted.
    pub async fn load(&self, fingerprint: &str) -> Option<Checkpoint> {
        let path = self.path();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(%err, path = %path.display(), "unreadable checkpoint, ignoring");
                return None;
            }
        };
        let checkpoint: Checkpoint = match serde_json::from_str(&text) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(%err, path = %path.display(), "malformed checkpoint, ignoring");
                return None;
            }
        };
        if checkpoint.fingerprint != fingerprint {
            debug!("checkpoint fingerprint mismatch, ignoring");
            return None;
        }
        Some(checkpoint)
    }

    /// Delete the checkpoint record; idempotent when absent.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(self.path()).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing checkpoint {}", self.path().display()))
            }
        }
    }
}

fn fingerprint_value(value: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    // serde_json maps are BTreeMap-backed, so this rendering is key-sorted.
    let canonical = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailctx_core::{AttachmentRef, FilterMode};
    use serde_json::json;
    use tempfile::tempdir;

    fn content(date: &str) -> MessageContent {
        MessageContent {
            subject: "Quarterly report".into(),
            from: "Alice Example <alice@example.com>".into(),
            to: "bob@example.com".into(),
            date: date.into(),
            body_text: "numbers inside".into(),
            body_html: String::new(),
            attachments: vec![AttachmentRef {
                filename: "q3.pdf".into(),
                mime_type: "application/pdf".into(),
                attachment_id: "att-1".into(),
            }],
            labels: vec!["Inbox".into(), "Finance".into()],
        }
    }

    #[test]
    fn parses_known_date_formats() {
        for raw in [
            "Sun, 22 Jun 2025 22:47:06 +0000",
            "Sun, 22 Jun 2025 22:47:06 +0000 (UTC)",
            "22 Jun 2025 22:47:06 +0000",
            "2025-06-22 22:47:06 +0000",
            "2025-06-22 22:47:06",
            "Sun, 22 Jun 2025 22:47:06",
        ] {
            let parsed = parse_message_date(raw).unwrap_or_else(|| panic!("failed on {raw}"));
            assert_eq!(parsed.format("%Y%m%d%H%M%S").to_string(), "20250622224706");
        }
    }

    #[test]
    fn unparseable_date_returns_none() {
        assert!(parse_message_date("not a date at all").is_none());
        assert!(parse_message_date("").is_none());
    }

    #[tokio::test]
    async fn write_persists_artifact_under_timestamp_slot() {
        let dir = tempdir().expect("tempdir");
        let writer = ContextWriter::new(dir.path());
        let outcome = writer
            .write("work", "msg-1", Some("thread-1"), &content("Sun, 22 Jun 2025 22:47:06 +0000"))
            .await
            .expect("write");

        let WriteOutcome::Created { path, artifact } = outcome else {
            panic!("expected Created");
        };
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "context-20250622224706.json"
        );
        assert_eq!(artifact.kind, "mail");
        assert_eq!(artifact.folder, "Inbox");
        assert_eq!(artifact.identity_key(), "msg-1");
        assert!(artifact.display_name.starts_with("mail_work_alice_example_"));
        assert!(artifact.rendering.contains("MESSAGE CONTENT:\nnumbers inside"));
        assert!(artifact.rendering.contains("ATTACHMENTS (1):\n- q3.pdf (application/pdf)"));
        assert!(artifact.metadata.has_attachments);
        assert!(artifact.metadata.attachments[0]
            .download_url
            .contains("/messages/msg-1/attachments/att-1"));

        let on_disk: ContextArtifact =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, *artifact);
    }

    #[tokio::test]
    async fn second_write_to_same_slot_reports_occupied() {
        let dir = tempdir().expect("tempdir");
        let writer = ContextWriter::new(dir.path());
        let first = writer
            .write("work", "msg-1", None, &content("Sun, 22 Jun 2025 22:47:06 +0000"))
            .await
            .expect("first write");
        assert!(matches!(first, WriteOutcome::Created { .. }));

        // Distinct message whose date collides at second resolution.
        let second = writer
            .write("work", "msg-2", None, &content("2025-06-22 22:47:06 +0000"))
            .await
            .expect("second write");
        assert!(matches!(second, WriteOutcome::SlotOccupied { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn unparseable_date_falls_back_to_current_time() {
        let dir = tempdir().expect("tempdir");
        let writer = ContextWriter::new(dir.path());
        let outcome = writer
            .write("work", "msg-3", None, &content("garbled nonsense"))
            .await
            .expect("write");
        let WriteOutcome::Created { artifact, .. } = outcome else {
            panic!("expected Created despite bad date");
        };
        assert!(!artifact.recorded_at.is_empty());
        assert_eq!(artifact.metadata.date, "garbled nonsense");
    }

    #[tokio::test]
    async fn dedup_scan_skips_malformed_and_foreign_files() {
        let dir = tempdir().expect("tempdir");
        let writer = ContextWriter::new(dir.path());
        writer
            .write("work", "msg-1", None, &content("Sun, 22 Jun 2025 22:47:06 +0000"))
            .await
            .expect("write");
        std::fs::write(dir.path().join("context-19990101000000.json"), "{ truncated").unwrap();
        std::fs::write(
            dir.path().join("context-19990101000001.json"),
            json!({"type": "note", "metadata": {"message_id": "other"}}).to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an artifact").unwrap();

        let index = DedupIndex::scan(dir.path()).await.expect("scan");
        assert_eq!(index.len(), 1);
        assert!(index.contains("msg-1"));
        assert!(!index.contains("other"));
    }

    #[tokio::test]
    async fn dedup_scan_of_missing_root_is_empty() {
        let dir = tempdir().expect("tempdir");
        let index = DedupIndex::scan(dir.path().join("nope")).await.expect("scan");
        assert!(index.is_empty());
    }

    fn params() -> FetchParams {
        FetchParams {
            account: Some("work".into()),
            filter: FilterMode::Folder("Sent".into()),
            limit: 100,
            create_context: true,
        }
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive_to_fetch_params() {
        let a = CheckpointStore::fingerprint(&params());
        let b = CheckpointStore::fingerprint(&params());
        assert_eq!(a, b);

        let mut different_limit = params();
        different_limit.limit = 200;
        assert_ne!(a, CheckpointStore::fingerprint(&different_limit));

        let mut different_filter = params();
        different_filter.filter = FilterMode::Unread;
        assert_ne!(a, CheckpointStore::fingerprint(&different_filter));
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = json!({"account": "work", "limit": 10, "create_context": true});
        let b = json!({"create_context": true, "limit": 10, "account": "work"});
        assert_eq!(fingerprint_value(&a), fingerprint_value(&b));
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_and_fingerprint_gating() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        let fingerprint = CheckpointStore::fingerprint(&params());
        let checkpoint = Checkpoint {
            fingerprint: fingerprint.clone(),
            saved_at: Utc::now(),
            processed: 40,
            total: 100,
            created: 30,
            skipped: 10,
        };
        store.save(&checkpoint).await.expect("save");

        let loaded = store.load(&fingerprint).await.expect("matching checkpoint");
        assert_eq!(loaded.processed, 40);
        assert_eq!(loaded.created, 30);

        assert!(store.load("different-fingerprint").await.is_none());
        // Stale checkpoint is ignored but not deleted.
        assert!(store.path().exists());

        store.clear().await.expect("clear");
        store.clear().await.expect("clear twice is fine");
        assert!(store.load(&fingerprint).await.is_none());
    }
}
