use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::config::DbConfig;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;

use crate::autosave::{SaveError, SaveRequest, SaveSink};
use crate::config::{ConfigPaths, StorageOptions};
use crate::messaging::{MessagingSource, SourceError, UnreadMessage};

mod schema;

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRecord {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub data: Value,
    pub revision: u64,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileWrite {
    Applied,
    Stale { current: u64 },
}

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    /// Creates the profile if needed and refreshes its public identity.
    pub fn ensure_profile(
        &self,
        user_id: &str,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<()> {
        let now = unix_millis(OffsetDateTime::now_utc());
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO profiles (user_id, display_name, avatar_url, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                     display_name = excluded.display_name,
                     avatar_url = COALESCE(excluded.avatar_url, profiles.avatar_url)",
                params![user_id, display_name, avatar_url, now],
            )
            .with_context(|| format!("upserting profile {user_id}"))?;
            Ok(())
        })
    }

    pub fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRecord>> {
        self.with_connection(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, display_name, avatar_url, data, revision, updated_at
                     FROM profiles WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;
            let Some((user_id, display_name, avatar_url, data, revision, updated_at)) = row else {
                return Ok(None);
            };
            let data = serde_json::from_str(&data)
                .with_context(|| format!("parsing stored profile data for {user_id}"))?;
            Ok(Some(ProfileRecord {
                user_id,
                display_name,
                avatar_url,
                data,
                revision: revision.max(0) as u64,
                updated_at: from_unix_millis(updated_at),
            }))
        })
    }

    /// Stores profile form data unless a newer revision is already present.
    pub fn save_profile_data(&self, user_id: &str, data: &Value, revision: u64) -> Result<ProfileWrite> {
        let encoded = serde_json::to_string(data).context("serialising profile data")?;
        let now = unix_millis(OffsetDateTime::now_utc());
        self.with_connection(|conn| {
            let updated = conn.execute(
                "UPDATE profiles SET data = ?1, revision = ?2, updated_at = ?3
                 WHERE user_id = ?4 AND revision < ?2",
                params![encoded, revision as i64, now, user_id],
            )?;
            if updated == 1 {
                return Ok(ProfileWrite::Applied);
            }
            let current: Option<i64> = conn
                .query_row(
                    "SELECT revision FROM profiles WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            match current {
                Some(current) => Ok(ProfileWrite::Stale {
                    current: current.max(0) as u64,
                }),
                None => bail!("profile {user_id} not found"),
            }
        })
    }

    pub fn send_message(&self, sender_id: &str, receiver_id: &str, content: &str) -> Result<i64> {
        self.insert_message(sender_id, receiver_id, content, OffsetDateTime::now_utc())
    }

    fn insert_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        created_at: OffsetDateTime,
    ) -> Result<i64> {
        let content = content.trim();
        if content.is_empty() {
            bail!("message content cannot be empty");
        }
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO messages (sender_id, receiver_id, content, read, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![sender_id, receiver_id, content, unix_millis(created_at)],
            )
            .with_context(|| format!("sending message from {sender_id} to {receiver_id}"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn fetch_unread_messages(&self, receiver_id: &str) -> Result<Vec<UnreadMessage>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.sender_id, p.display_name, p.avatar_url, m.created_at
                 FROM messages m
                 JOIN profiles p ON p.user_id = m.sender_id
                 WHERE m.receiver_id = ?1 AND m.read = 0
                 ORDER BY m.created_at DESC",
            )?;
            let messages = stmt
                .query_map(params![receiver_id], |row| {
                    Ok(UnreadMessage {
                        sender_id: row.get(0)?,
                        sender_name: row.get(1)?,
                        sender_avatar: row.get(2)?,
                        created_at: from_unix_millis(row.get(3)?),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("fetching unread messages")?;
            Ok(messages)
        })
    }

    pub fn mark_conversation_read(&self, receiver_id: &str, sender_id: &str) -> Result<usize> {
        self.with_connection(|conn| {
            let count = conn.execute(
                "UPDATE messages SET read = 1
                 WHERE receiver_id = ?1 AND sender_id = ?2 AND read = 0",
                params![receiver_id, sender_id],
            )?;
            Ok(count)
        })
    }
}

#[async_trait]
impl MessagingSource for StorageHandle {
    async fn unread_messages(&self, user_id: &str) -> Result<Vec<UnreadMessage>, SourceError> {
        let storage = self.clone();
        let user_id = user_id.to_owned();
        tokio::task::spawn_blocking(move || storage.fetch_unread_messages(&user_id))
            .await
            .map_err(|err| SourceError::Unavailable(format!("storage task failed: {err}")))?
            .map_err(|err| SourceError::Unavailable(format!("{err:#}")))
    }
}

/// Saves auto-saved profile form data into the local `profiles` table.
///
/// Controller revisions restart at 1 for every session, so they are offset
/// by the revision stored when the sink was opened.
pub struct ProfileSink {
    storage: StorageHandle,
    user_id: String,
    base_revision: u64,
}

impl ProfileSink {
    pub fn open(storage: StorageHandle, user_id: &str) -> Result<Self> {
        let profile = storage
            .fetch_profile(user_id)?
            .with_context(|| format!("profile {user_id} not found"))?;
        Ok(Self {
            storage,
            user_id: user_id.to_owned(),
            base_revision: profile.revision,
        })
    }
}

#[async_trait]
impl SaveSink<Value> for ProfileSink {
    async fn save(&self, request: SaveRequest<Value>) -> Result<(), SaveError> {
        let storage = self.storage.clone();
        let user_id = self.user_id.clone();
        let revision = self.base_revision + request.revision;
        let write = tokio::task::spawn_blocking(move || {
            storage.save_profile_data(&user_id, &request.snapshot, revision)
        })
        .await
        .map_err(|err| SaveError::Unavailable(format!("storage task failed: {err}")))?
        .map_err(|err| SaveError::Unavailable(format!("{err:#}")))?;
        match write {
            ProfileWrite::Applied => Ok(()),
            ProfileWrite::Stale { current } => Err(SaveError::Stale {
                attempted: revision,
                current,
            }),
        }
    }
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions) -> Result<StorageHandle> {
    let db_path = if storage.database_path.as_os_str().is_empty() {
        &paths.database_path
    } else {
        &storage.database_path
    };
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    tracing::debug!(path = %db_path.display(), "storage ready");
    Ok(StorageHandle {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(storage.clone()),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)
        .context("enabling foreign keys")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.busy_timeout(Duration::from_millis(storage.busy_timeout_ms))
        .context("setting busy timeout")?;
    Ok(())
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_unix_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;
    use time::macros::datetime;

    use super::*;
    use crate::autosave::{AutoSaveController, AutoSaveOptions, SaveStatus};
    use crate::messaging::aggregate;

    fn init_storage() -> anyhow::Result<(TempDir, StorageHandle)> {
        let temp = TempDir::new()?;
        let config_dir = temp.path().join("config");
        let paths = ConfigPaths::rooted(
            config_dir.clone(),
            config_dir.join("config.toml"),
            temp.path().join("data"),
        );
        paths.ensure_directories()?;
        let storage = init(&paths, &StorageOptions::default())?;
        Ok((temp, storage))
    }

    #[test]
    fn ensure_profile_keeps_existing_avatar() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        storage.ensure_profile("u1", "Luna", Some("avatars/luna.png"))?;
        storage.ensure_profile("u1", "Luna Rey", None)?;

        let profile = storage.fetch_profile("u1")?.expect("profile exists");
        assert_eq!(profile.display_name, "Luna Rey");
        assert_eq!(profile.avatar_url.as_deref(), Some("avatars/luna.png"));
        assert_eq!(profile.data, json!({}));
        assert_eq!(profile.revision, 0);
        Ok(())
    }

    #[test]
    fn older_revisions_are_rejected() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        storage.ensure_profile("u1", "Luna", None)?;

        let write = storage.save_profile_data("u1", &json!({ "bio": "new" }), 2)?;
        assert_eq!(write, ProfileWrite::Applied);
        let write = storage.save_profile_data("u1", &json!({ "bio": "old" }), 1)?;
        assert_eq!(write, ProfileWrite::Stale { current: 2 });

        let profile = storage.fetch_profile("u1")?.expect("profile exists");
        assert_eq!(profile.data, json!({ "bio": "new" }));
        assert!(storage.save_profile_data("ghost", &json!({}), 1).is_err());
        Ok(())
    }

    #[test]
    fn unread_messages_roll_up_per_sender() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        for (id, name) in [("me", "Me"), ("ana", "Ana"), ("beto", "Beto")] {
            storage.ensure_profile(id, name, None)?;
        }
        storage.insert_message("ana", "me", "hola", datetime!(2024-03-01 10:00 UTC))?;
        storage.insert_message("beto", "me", "ey", datetime!(2024-03-01 11:00 UTC))?;
        storage.insert_message("ana", "me", "@me mira esto", datetime!(2024-03-01 12:00 UTC))?;
        storage.insert_message("me", "ana", "ok", datetime!(2024-03-01 12:05 UTC))?;

        let snapshot = aggregate(&storage.fetch_unread_messages("me")?);
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.conversations[0].partner_id, "ana");
        assert_eq!(snapshot.conversations[0].partner_name, "Ana");
        assert_eq!(snapshot.conversations[0].unread_count, 2);

        assert_eq!(storage.mark_conversation_read("me", "ana")?, 2);
        let snapshot = aggregate(&storage.fetch_unread_messages("me")?);
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.conversations[0].partner_id, "beto");
        Ok(())
    }

    #[test]
    fn empty_messages_are_refused() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        storage.ensure_profile("a", "A", None)?;
        storage.ensure_profile("b", "B", None)?;
        assert!(storage.send_message("a", "b", "   ").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn profile_sink_persists_autosaved_snapshot() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        storage.ensure_profile("u1", "Luna", None)?;
        storage.save_profile_data("u1", &json!({ "bio": "" }), 4)?;

        let sink: Arc<dyn SaveSink<Value>> = Arc::new(ProfileSink::open(storage.clone(), "u1")?);
        let autosave = AutoSaveController::new(sink, json!({ "bio": "" }), AutoSaveOptions::default());
        autosave.update(json!({ "bio": "hello world" }));
        autosave.retry().await?;

        assert_eq!(autosave.status().status, SaveStatus::Saved);
        let profile = storage.fetch_profile("u1")?.expect("profile exists");
        assert_eq!(profile.data, json!({ "bio": "hello world" }));
        assert_eq!(profile.revision, 5);
        Ok(())
    }

    #[tokio::test]
    async fn profile_sink_reports_out_of_order_writes() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        storage.ensure_profile("u1", "Luna", None)?;
        let sink = ProfileSink::open(storage.clone(), "u1")?;

        sink.save(SaveRequest {
            revision: 2,
            snapshot: json!({ "bio": "newer" }),
        })
        .await?;
        let outcome = sink
            .save(SaveRequest {
                revision: 1,
                snapshot: json!({ "bio": "older" }),
            })
            .await;
        assert_matches!(outcome, Err(SaveError::Stale { attempted: 1, current: 2 }));
        Ok(())
    }
}
