use std::io::{self, BufRead, Write as _};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use mailctx_core::{Checkpoint, FilterMode};
use mailctx_source::{FixtureProvider, MailProvider};
use mailctx_sync::{
    BatchOutcome, CredentialProvider, IngestPipeline, ProgressSink, SyncError, SyncOptions,
};
use serde::Deserialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mailctx")]
#[command(about = "Mail context ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch matching messages and write context artifacts.
    Sync(SyncArgs),
    /// List the accounts configured in the accounts file.
    Accounts(AccountsArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Account name from the accounts file; defaults to the first entry.
    #[arg(long)]
    account: Option<String>,

    /// Process only unread messages (the default).
    #[arg(long, conflicts_with_all = ["all", "folder", "recent", "search"])]
    unread: bool,

    /// Process all messages instead of only unread ones.
    #[arg(long, conflicts_with_all = ["folder", "recent", "search"])]
    all: bool,

    /// Process messages from a folder or label.
    #[arg(long, conflicts_with_all = ["recent", "search"])]
    folder: Option<String>,

    /// Process messages received within the last N days.
    #[arg(long, value_name = "DAYS", conflicts_with = "search")]
    recent: Option<i64>,

    /// Process messages matching a raw search query.
    #[arg(long, value_name = "QUERY")]
    search: Option<String>,

    /// Maximum number of messages to process; 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    count: usize,

    /// Directory where context artifacts and run state are written.
    #[arg(long, default_value = "./context")]
    context_dir: PathBuf,

    /// Accounts file path.
    #[arg(long, default_value = "mail_accounts.json")]
    accounts: PathBuf,

    /// Ignore any saved run state and start from the beginning.
    #[arg(long)]
    fresh: bool,

    /// Start at this position in the listing (0-based); clears saved state.
    #[arg(long, value_name = "N")]
    start_from: Option<usize>,

    /// Resume from saved state without prompting.
    #[arg(long, short = 'y')]
    yes: bool,

    /// Show a progress bar.
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Args)]
struct AccountsArgs {
    /// Accounts file path.
    #[arg(long, default_value = "mail_accounts.json")]
    accounts: PathBuf,
}

impl Default for SyncArgs {
    fn default() -> Self {
        Self {
            account: None,
            unread: false,
            all: false,
            folder: None,
            recent: None,
            search: None,
            count: 0,
            context_dir: PathBuf::from("./context"),
            accounts: PathBuf::from("mail_accounts.json"),
            fresh: false,
            start_from: None,
            yes: false,
            progress: false,
        }
    }
}

impl SyncArgs {
    fn filter(&self) -> FilterMode {
        if let Some(query) = &self.search {
            FilterMode::Search(query.clone())
        } else if let Some(days) = &self.recent {
            FilterMode::RecentDays(*days)
        } else if let Some(folder) = &self.folder {
            FilterMode::Folder(folder.clone())
        } else if self.all {
            FilterMode::All
        } else {
            FilterMode::Unread
        }
    }
}

/// One configured account. `mailbox` points at a serialized mailbox
/// snapshot consumed by the fixture provider.
#[derive(Debug, Clone, Deserialize)]
struct AccountEntry {
    name: String,
    email: String,
    mailbox: PathBuf,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    accounts: Vec<AccountEntry>,
}

impl AccountsFile {
    fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading accounts file {}", path.display()))?;
        let file: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing accounts file {}", path.display()))?;
        if file.accounts.is_empty() {
            bail!("accounts file {} lists no accounts", path.display());
        }
        Ok(file)
    }
}

/// Resolves an account name against the accounts file and opens its
/// mailbox snapshot as a provider.
struct FileCredentials {
    accounts: Vec<AccountEntry>,
}

#[async_trait]
impl CredentialProvider for FileCredentials {
    async fn authorize(&self, account: Option<&str>) -> Result<Box<dyn MailProvider>> {
        let entry = match account {
            Some(name) => self
                .accounts
                .iter()
                .find(|a| a.name == name)
                .with_context(|| format!("account {name} is not configured"))?,
            None => &self.accounts[0],
        };
        let provider =
            FixtureProvider::from_file(&entry.mailbox)?.with_email(&entry.email);
        Ok(Box::new(provider))
    }
}

/// Terminal progress: status lines always, a bar only when requested, and
/// an interactive resume prompt.
struct TerminalProgress {
    bar: Mutex<Option<ProgressBar>>,
    show_bar: bool,
    assume_yes: bool,
}

impl TerminalProgress {
    fn new(show_bar: bool, assume_yes: bool) -> Self {
        Self {
            bar: Mutex::new(None),
            show_bar,
            assume_yes,
        }
    }
}

impl ProgressSink for TerminalProgress {
    fn progress(&self, account: &str, processed: usize, total: usize, eta_secs: f64) {
        if !self.show_bar {
            return;
        }
        let mut guard = self.bar.lock().unwrap();
        let bar = guard.get_or_insert_with(|| {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::with_template(
                    "{prefix} [{bar:30}] {pos}/{len} {msg}",
                )
                .expect("valid progress template")
                .progress_chars("=> "),
            );
            bar.set_prefix(account.to_string());
            bar
        });
        bar.set_position(processed as u64);
        bar.set_message(format!("eta {}s", eta_secs.round() as u64));
        if processed >= total {
            bar.finish_and_clear();
        }
    }

    fn status(&self, account: &str, message: &str) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            bar.println(format!("{account}: {message}"));
        } else {
            eprintln!("{account}: {message}");
        }
    }

    fn confirm_resume(&self, checkpoint: &Checkpoint) -> bool {
        if self.assume_yes {
            return true;
        }
        eprint!(
            "Found saved progress: {}/{} processed ({} created, {} skipped). Resume? [Y/n] ",
            checkpoint.processed, checkpoint.total, checkpoint.created, checkpoint.skipped
        );
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return true;
        }
        !matches!(answer.trim().to_ascii_lowercase().as_str(), "n" | "no")
    }
}

async fn run_sync(args: SyncArgs) -> Result<()> {
    let accounts = AccountsFile::load(&args.accounts)?;
    let credentials = FileCredentials {
        accounts: accounts.accounts,
    };

    let mut options = SyncOptions::new(&args.context_dir);
    options.account = args.account.clone();
    options.filter = args.filter();
    options.limit = args.count;
    options.fresh = args.fresh;
    options.start_from = args.start_from;
    options.assume_yes = args.yes;

    let pipeline = IngestPipeline::new(Box::new(credentials))
        .with_progress(Box::new(TerminalProgress::new(args.progress, args.yes)));

    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current message; progress will be saved.");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let report = match pipeline.run(&options).await {
        Ok(report) => report,
        Err(SyncError::StartOutOfRange { start, total }) => {
            bail!("start position {start} is beyond total messages ({total})");
        }
        Err(err) => return Err(err.into()),
    };

    for item in &report.items {
        if let mailctx_sync::ItemOutcome::Failed { reason } = &item.outcome {
            warn!(message_id = %item.message_id, reason = %reason, "item failed");
        }
    }

    match report.outcome {
        BatchOutcome::Completed => {
            println!(
                "sync complete: account={} processed={}/{} created={} skipped={}",
                report.account, report.processed, report.total, report.created, report.skipped
            );
        }
        BatchOutcome::Interrupted { resume_at } => {
            println!(
                "sync interrupted at {}/{}: created={} skipped={}",
                resume_at, report.total, report.created, report.skipped
            );
            println!("run the same command again to resume");
        }
        BatchOutcome::NothingToDo => {
            println!("nothing to do");
        }
    }
    Ok(())
}

fn run_accounts(args: AccountsArgs) -> Result<()> {
    let file = AccountsFile::load(&args.accounts)?;
    for entry in &file.accounts {
        match &entry.description {
            Some(description) => {
                println!("{}\t{}\t{}", entry.name, entry.email, description)
            }
            None => println!("{}\t{}", entry.name, entry.email),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => run_sync(args).await,
        Commands::Accounts(args) => run_accounts(args),
    }
}
