use std::fmt::Write as _;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::autosave::{AutoSaveController, AutoSaveOptions, SaveSink, SaveState, SaveStatus};
use crate::config::{AppConfig, ConfigPaths};
use crate::drafts::{Draft, DraftStore};
use crate::messaging::{
    aggregate, extract_mentions, MessagingSource, UnreadAlertGate, UnreadPoller, UnreadSnapshot,
};
use crate::network::{NetworkObserver, SimulatedConnectivity};
use crate::storage::{ProfileSink, StorageHandle};

const SETTLE_MARGIN: Duration = Duration::from_millis(50);

#[derive(Args, Debug, Clone)]
pub struct ProfileArgs {
    #[command(subcommand)]
    pub command: ProfileCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProfileCommand {
    /// Replay JSON snapshots from stdin (one per line) through auto-save.
    /// Lines `#offline` and `#online` toggle simulated connectivity.
    Edit(ProfileEditArgs),
    /// Print the stored profile data
    Show(ProfileShowArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProfileEditArgs {
    /// Profile owner
    #[arg(long)]
    pub user: String,
    /// Display name used when the profile does not exist yet
    #[arg(long)]
    pub name: Option<String>,
    /// Pause between stdin lines
    #[arg(long, default_value_t = 0)]
    pub interval_ms: u64,
    /// Override the configured debounce delay
    #[arg(long)]
    pub debounce_ms: Option<u64>,
    /// Retry once if the final auto-save failed
    #[arg(long)]
    pub retry: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ProfileShowArgs {
    #[arg(long)]
    pub user: String,
}

#[derive(Args, Debug, Clone)]
pub struct MessageArgs {
    #[command(subcommand)]
    pub command: MessageCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum MessageCommand {
    /// Send a direct message
    Send(MessageSendArgs),
    /// Mark every message from one partner as read
    Read(MessageReadArgs),
}

#[derive(Args, Debug, Clone)]
pub struct MessageSendArgs {
    #[arg(long)]
    pub from: String,
    #[arg(long)]
    pub to: String,
    /// Message text; `@handle` mentions are reported
    pub text: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct MessageReadArgs {
    /// Receiving user
    #[arg(long)]
    pub user: String,
    /// Conversation partner
    #[arg(long)]
    pub from: String,
}

#[derive(Args, Debug, Clone)]
pub struct UnreadArgs {
    #[arg(long)]
    pub user: String,
    /// Keep polling and print every change until interrupted
    #[arg(long)]
    pub watch: bool,
    /// Print the snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn handle_profile_command(
    config: Arc<AppConfig>,
    storage: StorageHandle,
    args: ProfileArgs,
) -> Result<()> {
    match args.command {
        ProfileCommand::Edit(edit) => edit_profile(config, storage, edit).await,
        ProfileCommand::Show(show) => show_profile(&storage, &show.user),
    }
}

pub async fn edit_profile(
    config: Arc<AppConfig>,
    storage: StorageHandle,
    args: ProfileEditArgs,
) -> Result<()> {
    let session = ProfileEditSession::open(&config, storage, &args)?;

    let mut states = session.autosave.subscribe();
    let printer = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            println!("{}", render_state(&state));
        }
    });

    let lines = read_stdin_lines()?;
    session
        .apply(&lines, Duration::from_millis(args.interval_ms))
        .await?;
    session.settle().await;
    if args.retry && session.autosave.status().status == SaveStatus::Error {
        tracing::info!("retrying failed auto-save");
        if let Err(err) = session.autosave.retry().await {
            tracing::warn!(error = %err, "retry failed");
        }
    }

    let outcome = session.conclude();
    println!("{}", outcome.message(&args.user));
    session.close().await;
    printer.abort();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    Disabled,
    Offline,
    /// Edits went back to the loaded profile after a different version was saved.
    Reverted,
    Pending,
}

/// How a `profile edit` run ended, and whether its draft survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    NoChanges,
    Saved { revision: u64 },
    Failed { kept_fields: usize },
    Suspended { reason: SuspendReason, kept_fields: usize },
}

impl EditOutcome {
    pub fn message(&self, user_id: &str) -> String {
        match self {
            Self::NoChanges => "no changes to save".to_string(),
            Self::Saved { revision } => format!("profile {user_id} saved (revision {revision})"),
            Self::Failed { kept_fields } => {
                format!("auto-save failed; draft with {kept_fields} field(s) kept for retry")
            }
            Self::Suspended { reason, kept_fields } => {
                let cause = match reason {
                    SuspendReason::Disabled => "auto-save disabled",
                    SuspendReason::Offline => "auto-save suspended while offline",
                    SuspendReason::Reverted => "edits match the original profile but not the saved one",
                    SuspendReason::Pending => "latest edit not saved yet",
                };
                format!("{cause}; draft with {kept_fields} field(s) kept")
            }
        }
    }
}

/// Auto-save, draft and simulated connectivity wiring behind `profile edit`.
pub struct ProfileEditSession {
    user_id: String,
    debounce: Duration,
    autosave: AutoSaveController<Value>,
    platform: Arc<SimulatedConnectivity>,
    network: NetworkObserver,
    drafts: DraftStore,
}

impl ProfileEditSession {
    pub fn open(config: &AppConfig, storage: StorageHandle, args: &ProfileEditArgs) -> Result<Self> {
        if storage.fetch_profile(&args.user)?.is_none() {
            let name = args.name.as_deref().unwrap_or(&args.user);
            storage.ensure_profile(&args.user, name, None)?;
        }
        let profile = storage
            .fetch_profile(&args.user)?
            .with_context(|| format!("profile {} not found", args.user))?;

        let mut options = AutoSaveOptions::from(&config.auto_save);
        if let Some(ms) = args.debounce_ms {
            options.debounce = Duration::from_millis(ms);
        }
        let sink: Arc<dyn SaveSink<Value>> = Arc::new(ProfileSink::open(storage, &args.user)?);
        let autosave = AutoSaveController::new(sink, profile.data, options.clone());

        let platform =
            SimulatedConnectivity::new(true, Some(config.network.initial_quality.as_ref()));
        let network = NetworkObserver::start(platform.clone());
        autosave.follow_network(network.subscribe());

        Ok(Self {
            user_id: args.user.clone(),
            debounce: options.debounce,
            autosave,
            platform,
            network,
            drafts: DraftStore::new(),
        })
    }

    /// Feeds snapshot lines through the draft store and auto-save.
    /// `#offline` and `#online` toggle connectivity instead.
    pub async fn apply(&self, lines: &[String], interval: Duration) -> Result<()> {
        for (index, line) in lines.iter().enumerate() {
            match line.trim() {
                "" => continue,
                "#offline" => self.platform.set_online(false),
                "#online" => self.platform.set_online(true),
                raw => {
                    let snapshot: Value = serde_json::from_str(raw)
                        .with_context(|| format!("parsing snapshot on line {}", index + 1))?;
                    self.drafts.set(&self.user_id, Draft::from_json(&snapshot));
                    self.autosave.update(snapshot);
                }
            }
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(())
    }

    /// Waits out the debounce window and any save still in flight.
    pub async fn settle(&self) {
        tokio::time::sleep(self.debounce + SETTLE_MARGIN).await;
        let mut states = self.autosave.subscribe();
        loop {
            let status = states.borrow_and_update().status;
            if status != SaveStatus::Saving {
                break;
            }
            if states.changed().await.is_err() {
                break;
            }
        }
    }

    /// Clears the draft only once the sink holds the latest snapshot.
    pub fn conclude(&self) -> EditOutcome {
        let kept_fields = || {
            self.drafts
                .get(&self.user_id)
                .map(|draft| draft.fields.len())
                .unwrap_or_default()
        };
        if self.autosave.status().status == SaveStatus::Error {
            return EditOutcome::Failed {
                kept_fields: kept_fields(),
            };
        }
        if !self.autosave.has_unsaved_changes() {
            self.drafts.clear(&self.user_id);
            return match self.autosave.saved_revision() {
                0 => EditOutcome::NoChanges,
                revision => EditOutcome::Saved { revision },
            };
        }
        let reason = if !self.autosave.is_enabled() {
            SuspendReason::Disabled
        } else if !self.network.is_online() {
            SuspendReason::Offline
        } else if self.autosave.latest() == self.autosave.baseline() {
            SuspendReason::Reverted
        } else {
            SuspendReason::Pending
        };
        EditOutcome::Suspended {
            reason,
            kept_fields: kept_fields(),
        }
    }

    pub async fn close(self) {
        let Self {
            autosave, network, ..
        } = self;
        drop(autosave);
        network.shutdown().await;
    }
}

fn show_profile(storage: &StorageHandle, user_id: &str) -> Result<()> {
    let profile = storage
        .fetch_profile(user_id)?
        .with_context(|| format!("profile {user_id} not found"))?;
    println!(
        "{} ({}) revision {} updated {}",
        profile.display_name,
        profile.user_id,
        profile.revision,
        format_timestamp(profile.updated_at)
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&profile.data).context("rendering profile data")?
    );
    Ok(())
}

pub fn handle_message_command(storage: StorageHandle, args: MessageArgs) -> Result<()> {
    match args.command {
        MessageCommand::Send(send) => {
            let text = send.text.join(" ");
            ensure_known(&storage, &send.from)?;
            ensure_known(&storage, &send.to)?;
            let id = storage
                .send_message(&send.from, &send.to, &text)
                .context("sending message")?;
            println!("Sent message #{id} to {}", send.to);
            let mentions = extract_mentions(&text);
            if !mentions.is_empty() {
                let handles: Vec<String> = mentions.iter().map(|m| format!("@{}", m.handle)).collect();
                println!("Mentions: {}", handles.join(", "));
            }
            Ok(())
        }
        MessageCommand::Read(read) => {
            let count = storage.mark_conversation_read(&read.user, &read.from)?;
            println!("Marked {count} message(s) from {} as read", read.from);
            Ok(())
        }
    }
}

fn ensure_known(storage: &StorageHandle, user_id: &str) -> Result<()> {
    if storage.fetch_profile(user_id)?.is_none() {
        storage.ensure_profile(user_id, user_id, None)?;
    }
    Ok(())
}

pub async fn show_unread(config: Arc<AppConfig>, storage: StorageHandle, args: UnreadArgs) -> Result<()> {
    let mut gate = UnreadAlertGate::new();
    if !args.watch {
        let messages = storage
            .unread_messages(&args.user)
            .await
            .context("loading unread messages")?;
        let snapshot = aggregate(&messages);
        print_unread(&args, &snapshot, &mut gate, config.messaging.alert_enabled)?;
        return Ok(());
    }

    let source: Arc<dyn MessagingSource> = Arc::new(storage);
    let poller = UnreadPoller::spawn(source, args.user.clone(), config.messaging.poll_interval);
    let mut updates = poller.subscribe();
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                print_unread(&args, &snapshot, &mut gate, config.messaging.alert_enabled)?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn print_unread(
    args: &UnreadArgs,
    snapshot: &UnreadSnapshot,
    gate: &mut UnreadAlertGate,
    alert_enabled: bool,
) -> Result<()> {
    if args.json {
        println!(
            "{}",
            serde_json::to_string(snapshot).context("rendering unread snapshot")?
        );
    } else {
        println!("{}", render_unread(snapshot));
    }
    if let Some(alert) = gate.observe(Some(args.user.as_str()), snapshot) {
        if alert_enabled {
            println!("{}", alert.message());
        }
    }
    Ok(())
}

pub fn show_config(config: &AppConfig, paths: &ConfigPaths) -> Result<()> {
    println!("config file: {}", paths.config_file.display());
    println!("database:    {}", config.storage.database_path.display());
    println!();
    print!(
        "{}",
        toml::to_string_pretty(config).context("rendering configuration")?
    );
    Ok(())
}

pub fn render_state(state: &SaveState) -> String {
    match state.status {
        SaveStatus::Saving => format!("[saving] revision {}", state.revision),
        SaveStatus::Saved => match state.last_saved_at {
            Some(at) => format!("[saved] revision {} at {}", state.revision, format_timestamp(at)),
            None => format!("[saved] revision {}", state.revision),
        },
        SaveStatus::Error => format!(
            "[error] {}",
            state.last_error.as_deref().unwrap_or("unknown failure")
        ),
        SaveStatus::Idle => "[idle]".to_string(),
    }
}

pub fn render_unread(snapshot: &UnreadSnapshot) -> String {
    if snapshot.is_empty() {
        return "No unread messages".to_string();
    }
    let mut out = String::new();
    let _ = write!(
        out,
        "{} unread across {} conversation(s)",
        snapshot.total,
        snapshot.conversations.len()
    );
    for conversation in &snapshot.conversations {
        let _ = write!(
            out,
            "\n  {:<16} {:>3}  {}",
            conversation.partner_name,
            conversation.unread_count,
            format_timestamp(conversation.last_message_at)
        );
    }
    out
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

fn read_stdin_lines() -> Result<Vec<String>> {
    let stdin = io::stdin();
    if atty::is(atty::Stream::Stdin) {
        eprintln!("Reading profile snapshots from stdin (Ctrl-D to finish)...");
    }
    stdin
        .lock()
        .lines()
        .collect::<io::Result<Vec<_>>>()
        .context("reading snapshots from stdin")
}
