use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

pub mod mentions;

pub use mentions::{extract_mentions, Mention};

/// One unread message addressed to the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub partner_id: String,
    pub partner_name: String,
    pub partner_avatar: Option<String>,
    pub unread_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_message_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnreadSnapshot {
    pub total: u32,
    /// Most recent conversation first; ties are in no particular order.
    pub conversations: Vec<ConversationSummary>,
}

impl UnreadSnapshot {
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Rolls a flat list of unread messages up into per-conversation summaries.
pub fn aggregate(messages: &[UnreadMessage]) -> UnreadSnapshot {
    let mut by_partner: HashMap<&str, ConversationSummary> = HashMap::new();
    for message in messages {
        by_partner
            .entry(message.sender_id.as_str())
            .and_modify(|summary| {
                summary.unread_count += 1;
                if message.created_at > summary.last_message_at {
                    summary.last_message_at = message.created_at;
                }
            })
            .or_insert_with(|| ConversationSummary {
                partner_id: message.sender_id.clone(),
                partner_name: message.sender_name.clone(),
                partner_avatar: message.sender_avatar.clone(),
                unread_count: 1,
                last_message_at: message.created_at,
            });
    }
    let mut conversations: Vec<ConversationSummary> = by_partner.into_values().collect();
    conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    UnreadSnapshot {
        total: conversations.iter().map(|c| c.unread_count).sum(),
        conversations,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadAlert {
    pub user_id: String,
    pub total: u32,
    pub conversations: usize,
}

impl UnreadAlert {
    pub fn message(&self) -> String {
        let noun = if self.total == 1 { "message" } else { "messages" };
        let from = if self.conversations == 1 {
            "1 conversation".to_string()
        } else {
            format!("{} conversations", self.conversations)
        };
        format!("You have {} unread {noun} in {from}", self.total)
    }
}

/// Fires the "you have unread messages" alert at most once per login.
#[derive(Debug, Default)]
pub struct UnreadAlertGate {
    user_id: Option<String>,
    shown: bool,
}

impl UnreadAlertGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the current user and snapshot; returns the alert the first time
    /// it becomes due for this user.
    pub fn observe(&mut self, user_id: Option<&str>, snapshot: &UnreadSnapshot) -> Option<UnreadAlert> {
        if self.user_id.as_deref() != user_id {
            self.user_id = user_id.map(str::to_owned);
            self.shown = false;
        }
        let user_id = self.user_id.clone()?;
        if self.shown || snapshot.total == 0 || snapshot.conversations.is_empty() {
            return None;
        }
        self.shown = true;
        Some(UnreadAlert {
            user_id,
            total: snapshot.total,
            conversations: snapshot.conversations.len(),
        })
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("messaging backend unavailable: {0}")]
    Unavailable(String),
    #[error("malformed messaging data: {0}")]
    Malformed(String),
}

/// Remote messaging backend; treated as eventually consistent.
#[async_trait]
pub trait MessagingSource: Send + Sync {
    async fn unread_messages(&self, user_id: &str) -> Result<Vec<UnreadMessage>, SourceError>;
}

/// Re-aggregates unread messages on every tick or explicit refresh.
pub struct UnreadPoller {
    snapshot_rx: watch::Receiver<UnreadSnapshot>,
    refresh: Arc<Notify>,
    task: JoinHandle<()>,
}

impl UnreadPoller {
    pub fn spawn(source: Arc<dyn MessagingSource>, user_id: String, interval: Duration) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(UnreadSnapshot::default());
        let refresh = Arc::new(Notify::new());
        let trigger = refresh.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => {}
                }
                match source.unread_messages(&user_id).await {
                    Ok(messages) => {
                        let snapshot = aggregate(&messages);
                        tracing::debug!(user_id = %user_id, total = snapshot.total, "unread messages refreshed");
                        snapshot_tx.send_replace(snapshot);
                    }
                    Err(err) => {
                        tracing::warn!(user_id = %user_id, error = %err, "unread refresh failed; keeping previous snapshot");
                    }
                }
            }
        });
        Self {
            snapshot_rx,
            refresh,
            task,
        }
    }

    /// Requests an immediate refresh, e.g. on a push notification.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnreadSnapshot> {
        self.snapshot_rx.clone()
    }
}

impl Drop for UnreadPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}
