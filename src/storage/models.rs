use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who may see a document without an explicit grant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    #[default]
    Private,
    Shareable,
    PublicReadable,
    PublicCommentable,
    PublicEditable,
}

/// What part of a document a moderation lock applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Text,
    Page,
    Media,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLock {
    pub kind: LockKind,
    /// Page id or media name; `None` for whole-document text.
    #[serde(default)]
    pub target: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub words: Vec<String>,
    pub locked_at: DateTime<Utc>,
}

/// A document record stored in redb
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub project_id: Option<i64>,
    pub name: String,
    /// Opaque storage prefix, unrelated to `id`.
    pub path: String,
    pub doc_type: DocType,
    pub size: u64,
    /// Storage version id of the current `document-meta.json`.
    pub version_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locks: Vec<DocumentLock>,
}

impl Document {
    pub fn is_locked(&self) -> bool {
        !self.locks.is_empty()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Append-only version log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: i64,
    pub document_id: i64,
    pub version_id: String,
    /// Last edit-sequence number folded into this version.
    pub last_cmd_id: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentAccessRecord {
    pub id: i64,
    pub user_id: i64,
    pub document_id: i64,
    pub last_access_time: DateTime<Utc>,
}
