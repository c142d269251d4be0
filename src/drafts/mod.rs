use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// A locally staged file that has not been uploaded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: Uuid,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Arc<[u8]>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, content_type: Option<&str>, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            content_type: content_type.map(str::to_owned),
            data: Arc::from(data),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// In-progress form state handed to [`DraftStore::set`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Draft {
    pub fields: IndexMap<String, Value>,
    pub attachments: Vec<Attachment>,
    /// Explicit timestamp; the store stamps the current time when absent.
    pub updated_at: Option<OffsetDateTime>,
}

impl Draft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn updated_at(mut self, at: OffsetDateTime) -> Self {
        self.updated_at = Some(at);
        self
    }

    /// Builds a draft from a JSON object; other values yield an empty draft.
    pub fn from_json(value: &Value) -> Self {
        let fields = value
            .as_object()
            .map(|object| {
                object
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            fields,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftRecord {
    pub user_id: String,
    pub fields: IndexMap<String, Value>,
    pub attachments: Vec<Attachment>,
    pub updated_at: OffsetDateTime,
}

impl DraftRecord {
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }
}

/// Volatile per-user holder of unsaved edits, shared for the lifetime of an
/// application session. Cloning yields another handle to the same store.
#[derive(Debug, Clone, Default)]
pub struct DraftStore {
    drafts: Arc<RwLock<HashMap<String, DraftRecord>>>,
}

impl DraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<DraftRecord> {
        self.drafts.read().get(user_id).cloned()
    }

    /// Replaces whatever draft `user_id` had and returns the stored record.
    pub fn set(&self, user_id: &str, draft: Draft) -> DraftRecord {
        let record = DraftRecord {
            user_id: user_id.to_owned(),
            fields: draft.fields,
            attachments: draft.attachments,
            updated_at: draft.updated_at.unwrap_or_else(OffsetDateTime::now_utc),
        };
        self.drafts
            .write()
            .insert(user_id.to_owned(), record.clone());
        tracing::trace!(user_id, fields = record.fields.len(), "draft staged");
        record
    }

    /// Drops the draft for `user_id`, reporting whether one existed.
    pub fn clear(&self, user_id: &str) -> bool {
        self.drafts.write().remove(user_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.drafts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.read().is_empty()
    }

    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drafts.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn set_replaces_instead_of_merging() {
        let store = DraftStore::new();
        store.set("u1", Draft::new().field("bio", "A").field("city", "Lima"));
        store.set("u1", Draft::new().field("bio", "B"));

        let draft = store.get("u1").expect("draft present");
        assert_eq!(draft.fields.len(), 1);
        assert_eq!(draft.fields["bio"], json!("B"));
        assert!(draft.fields.get("city").is_none());
    }

    #[test]
    fn users_do_not_interfere() {
        let store = DraftStore::new();
        store.set("u1", Draft::new().field("bio", "mine"));
        store.set("u2", Draft::new().field("bio", "theirs"));
        assert!(store.clear("u2"));

        assert_eq!(store.get("u1").expect("u1 draft").fields["bio"], json!("mine"));
        assert!(store.get("u2").is_none());
        assert_eq!(store.user_ids(), vec!["u1".to_string()]);
    }

    #[test]
    fn explicit_timestamp_is_kept() {
        let store = DraftStore::new();
        let at = datetime!(2024-05-01 12:00 UTC);
        let record = store.set("u1", Draft::new().field("bio", "x").updated_at(at));
        assert_eq!(record.updated_at, at);
        assert_eq!(store.get("u1").expect("draft").updated_at, at);
    }

    #[test]
    fn repeated_set_is_idempotent_modulo_timestamp() {
        let store = DraftStore::new();
        let photo = Attachment::new("cover.png", Some("image/png"), vec![1, 2, 3]);
        let draft = Draft::new().field("bio", "same").attachment(photo.clone());
        let first = store.set("u1", draft.clone());
        let second = store.set("u1", draft);

        assert_eq!(first.fields, second.fields);
        assert_eq!(first.attachments, second.attachments);
        assert_eq!(store.len(), 1);
        assert_eq!(second.attachments[0].id, photo.id);
        assert_eq!(second.attachments[0].len(), 3);
    }

    #[test]
    fn handles_share_one_store() {
        let store = DraftStore::new();
        let other = store.clone();
        store.set("u1", Draft::from_json(&json!({ "bio": "hi", "links": ["a"] })));

        let record = other.get("u1").expect("visible through clone");
        assert_eq!(record.to_json(), json!({ "bio": "hi", "links": ["a"] }));
        assert!(other.clear("u1"));
        assert!(!store.clear("u1"));
        assert!(store.is_empty());
    }
}
