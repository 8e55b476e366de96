//! Batch ingestion orchestrator: lists matching messages, fetches and
//! normalizes each one, writes context artifacts through the dedup index,
//! and checkpoints progress so an interrupted run can resume exactly where
//! it stopped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailctx_core::{Checkpoint, ContextArtifact, FetchParams, FilterMode, MessageRef};
use mailctx_source::{extract, query_for, MailProvider, MailSource};
use mailctx_store::{CheckpointStore, ContextWriter, DedupIndex, WriteOutcome};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mailctx-sync";

/// Checkpoint cadence: progress is persisted after every N processed items.
pub const SAVE_EVERY: usize = 10;

const DEFAULT_ACCOUNT: &str = "primary";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no usable account: {0}")]
    NoUsableAccount(String),
    #[error("start position {start} is beyond total messages ({total})")]
    StartOutOfRange { start: usize, total: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Turns an account selection into an authorized provider handle. The
/// pipeline never sees credentials, only the resulting provider.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn authorize(&self, account: Option<&str>) -> anyhow::Result<Box<dyn MailProvider>>;
}

/// Receives run progress and status lines; also asked to confirm resuming
/// from a matching checkpoint. The default implementation is silent and
/// always resumes.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, _account: &str, _processed: usize, _total: usize, _eta_secs: f64) {}
    fn status(&self, _account: &str, _message: &str) {}
    fn confirm_resume(&self, _checkpoint: &Checkpoint) -> bool {
        true
    }
}

/// Sink that ignores everything.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

/// Gets every newly created artifact pushed to it. Subscriber errors are
/// logged and never fail the run.
pub trait ArtifactSubscriber: Send + Sync {
    fn on_artifact(&self, artifact: &ContextArtifact) -> anyhow::Result<()>;
}

/// Everything one run needs to know. Only the fields surfaced through
/// [`SyncOptions::fetch_params`] participate in the checkpoint fingerprint;
/// `fresh`, `start_from`, and `assume_yes` steer a single invocation.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub account: Option<String>,
    pub filter: FilterMode,
    pub limit: usize,
    pub storage_root: PathBuf,
    pub fresh: bool,
    pub start_from: Option<usize>,
    pub assume_yes: bool,
}

impl SyncOptions {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            account: None,
            filter: FilterMode::default(),
            limit: 0,
            storage_root: storage_root.into(),
            fresh: false,
            start_from: None,
            assume_yes: false,
        }
    }

    pub fn fetch_params(&self) -> FetchParams {
        FetchParams {
            account: self.account.clone(),
            filter: self.filter.clone(),
            limit: self.limit,
            create_context: true,
        }
    }
}

/// What happened to one listed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Created { path: PathBuf },
    Skipped,
    /// Listed but gone (or unfetchable) by the time it was processed.
    Missing,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub message_id: String,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    /// Stopped on a cancel request; a checkpoint at `resume_at` was saved.
    Interrupted { resume_at: usize },
    NothingToDo,
}

#[derive(Debug)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub account: String,
    pub outcome: BatchOutcome,
    pub total: usize,
    pub processed: usize,
    pub created: usize,
    pub skipped: usize,
    pub items: Vec<ItemRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The resumable ingestion pipeline. Holds the credential source, the
/// progress sink, artifact subscribers, and a shared cancel flag that a
/// signal handler can flip from another task.
pub struct IngestPipeline {
    credentials: Box<dyn CredentialProvider>,
    progress: Box<dyn ProgressSink>,
    subscribers: Vec<Box<dyn ArtifactSubscriber>>,
    cancel: Arc<AtomicBool>,
}

impl IngestPipeline {
    pub fn new(credentials: Box<dyn CredentialProvider>) -> Self {
        Self {
            credentials,
            progress: Box::new(NoopProgress),
            subscribers: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn subscribe(mut self, subscriber: Box<dyn ArtifactSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Shared flag checked before each item; set it to stop the run at the
    /// next item boundary with a saved checkpoint.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub async fn run(&self, options: &SyncOptions) -> Result<BatchReport, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let provider = self
            .credentials
            .authorize(options.account.as_deref())
            .await
            .map_err(|err| SyncError::NoUsableAccount(err.to_string()))?;
        let source = MailSource::new(provider);

        let account = match &options.account {
            Some(name) => name.clone(),
            None => source
                .profile()
                .await
                .map(|p| p.email_address)
                .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string()),
        };

        let query = query_for(&options.filter);
        info!(account = %account, query = %query, limit = options.limit, "listing messages");
        let refs = source.list(&query, options.limit).await;
        if refs.is_empty() {
            self.progress.status(&account, "no messages match the filter");
            return Ok(self.report(run_id, account, BatchOutcome::NothingToDo, 0, RunState::default(), started_at));
        }

        let fingerprint = CheckpointStore::fingerprint(&options.fetch_params());
        let checkpoints = CheckpointStore::new(&options.storage_root);

        let mut state = RunState::default();
        let start = if let Some(start) = options.start_from {
            if start >= refs.len() {
                return Err(SyncError::StartOutOfRange { start, total: refs.len() });
            }
            checkpoints.clear().await?;
            start
        } else if options.fresh {
            checkpoints.clear().await?;
            0
        } else if let Some(checkpoint) = checkpoints.load(&fingerprint).await {
            if checkpoint.processed >= refs.len() {
                self.progress.status(&account, "previous run already covered all messages");
                state.processed = checkpoint.processed;
                state.created = checkpoint.created;
                state.skipped = checkpoint.skipped;
                return Ok(self.report(
                    run_id,
                    account,
                    BatchOutcome::Completed,
                    refs.len(),
                    state,
                    started_at,
                ));
            }
            if !options.assume_yes && !self.progress.confirm_resume(&checkpoint) {
                self.progress.status(&account, "resume declined");
                return Ok(self.report(
                    run_id,
                    account,
                    BatchOutcome::NothingToDo,
                    refs.len(),
                    state,
                    started_at,
                ));
            }
            info!(
                resume_at = checkpoint.processed,
                total = refs.len(),
                "resuming from checkpoint"
            );
            state.created = checkpoint.created;
            state.skipped = checkpoint.skipped;
            checkpoint.processed
        } else {
            0
        };
        state.processed = start;

        tokio::fs::create_dir_all(&options.storage_root)
            .await
            .map_err(|err| SyncError::Other(err.into()))?;
        let mut dedup = DedupIndex::scan(&options.storage_root).await?;
        let writer = ContextWriter::new(&options.storage_root);

        let total = refs.len();
        let clock = Instant::now();
        let mut done_this_run = 0usize;

        for (idx, message) in refs.iter().enumerate().skip(start) {
            if self.cancel.load(Ordering::Relaxed) {
                let resume_at = state.processed;
                self.save_checkpoint(&checkpoints, &fingerprint, resume_at, total, &state)
                    .await;
                self.progress
                    .status(&account, "interrupted, progress saved");
                return Ok(self.report(
                    run_id,
                    account,
                    BatchOutcome::Interrupted { resume_at },
                    total,
                    state,
                    started_at,
                ));
            }

            let outcome = self
                .process_one(&source, &writer, &mut dedup, &account, message)
                .await;
            match &outcome {
                ItemOutcome::Created { .. } => state.created += 1,
                ItemOutcome::Skipped => state.skipped += 1,
                ItemOutcome::Missing => {
                    debug!(message_id = %message.id, "listed message not fetchable")
                }
                ItemOutcome::Failed { reason } => {
                    warn!(message_id = %message.id, reason = %reason, "processing failed")
                }
            }
            state.items.push(ItemRecord {
                message_id: message.id.clone(),
                outcome,
            });
            state.processed = idx + 1;
            done_this_run += 1;

            let remaining = (total - state.processed) as f64;
            let eta_secs = if done_this_run > 0 {
                clock.elapsed().as_secs_f64() / done_this_run as f64 * remaining
            } else {
                0.0
            };
            self.progress
                .progress(&account, state.processed, total, eta_secs);

            if done_this_run % SAVE_EVERY == 0 {
                self.save_checkpoint(&checkpoints, &fingerprint, state.processed, total, &state)
                    .await;
            }
        }

        // Final save first: if the clear fails, what survives is a
        // completed checkpoint rather than a stale mid-run one.
        self.save_checkpoint(&checkpoints, &fingerprint, state.processed, total, &state)
            .await;
        self.progress.status(
            &account,
            &format!(
                "done: {} created, {} skipped of {total}",
                state.created, state.skipped
            ),
        );
        checkpoints.clear().await?;
        Ok(self.report(run_id, account, BatchOutcome::Completed, total, state, started_at))
    }

    async fn process_one(
        &self,
        source: &MailSource,
        writer: &ContextWriter,
        dedup: &mut DedupIndex,
        account: &str,
        message: &MessageRef,
    ) -> ItemOutcome {
        let Some(raw) = source.fetch(&message.id).await else {
            return ItemOutcome::Missing;
        };
        if dedup.contains(&message.id) {
            return ItemOutcome::Skipped;
        }
        let content = extract(&raw);
        match writer
            .write(account, &message.id, raw.thread_id.as_deref(), &content)
            .await
        {
            Ok(WriteOutcome::Created { path, artifact }) => {
                dedup.insert(message.id.clone());
                for subscriber in &self.subscribers {
                    if let Err(err) = subscriber.on_artifact(&artifact) {
                        warn!(%err, message_id = %message.id, "artifact subscriber failed");
                    }
                }
                ItemOutcome::Created { path }
            }
            Ok(WriteOutcome::SlotOccupied { path }) => {
                debug!(message_id = %message.id, slot = %path.display(), "slot occupied, dropping item");
                ItemOutcome::Skipped
            }
            Err(err) => ItemOutcome::Failed {
                reason: format!("{err:#}"),
            },
        }
    }

    /// Checkpoint persistence is best-effort mid-run: a failed save costs at
    /// most `SAVE_EVERY` items of rework on resume.
    async fn save_checkpoint(
        &self,
        store: &CheckpointStore,
        fingerprint: &str,
        processed: usize,
        total: usize,
        state: &RunState,
    ) {
        let checkpoint = Checkpoint {
            fingerprint: fingerprint.to_string(),
            saved_at: Utc::now(),
            processed,
            total,
            created: state.created,
            skipped: state.skipped,
        };
        if let Err(err) = store.save(&checkpoint).await {
            warn!(%err, "saving checkpoint failed, continuing");
        }
    }

    fn report(
        &self,
        run_id: Uuid,
        account: String,
        outcome: BatchOutcome,
        total: usize,
        state: RunState,
        started_at: DateTime<Utc>,
    ) -> BatchReport {
        BatchReport {
            run_id,
            account,
            outcome,
            total,
            processed: state.processed,
            created: state.created,
            skipped: state.skipped,
            items: state.items,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    processed: usize,
    created: usize,
    skipped: usize,
    items: Vec<ItemRecord>,
}
