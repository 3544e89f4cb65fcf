//! Core identifier and record types shared across the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque account identifier assigned by the account service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque folder identifier assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderId(pub String);

impl FolderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic per-object revision number assigned by the store.
pub type Rev = i64;

/// Opaque pagination token returned by store queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(pub String);

/// Folder metadata as loaded from the store at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: FolderId,
    pub account_id: AccountId,
    pub name: String,
    /// Watermark of the last successfully committed sync. Absent on a folder
    /// that has never completed a sync (initial sync).
    pub last_sync_rev: Option<Rev>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// How the folder is kept in sync, recorded alongside the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderSyncStatus {
    /// Server push (e.g. IDLE) keeps the folder current.
    Push,
    /// Scheduled background sync.
    Scheduled,
    /// Only synced on user request.
    Manual,
}

/// Folder status written back to the store when a session ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderStatus {
    pub sync_status: FolderSyncStatus,
    /// New watermark; `None` when the sync was aborted before any revision
    /// was observed, in which case the stored watermark must be left alone.
    pub last_sync_rev: Option<Rev>,
    pub last_sync_time: DateTime<Utc>,
}

/// One changed object returned by an incremental-change query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Opaque object id within the folder.
    pub id: String,
    pub rev: Rev,
}

/// One page of an incremental-change query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangePage {
    pub changes: Vec<ChangeRecord>,
    pub next_page: Option<PageToken>,
}

/// Result of classifying a batch of changes against a session's cursor.
///
/// Changes the session itself produced are tracked separately so they are
/// never re-uploaded to the server, while still advancing the watermark.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Externally-caused changes that must be pushed to the server.
    pub needs_upload: Vec<ChangeRecord>,
    /// Self-caused changes (revisions the session already knows about).
    pub known: Vec<ChangeRecord>,
    /// Highest revision observed across the batch.
    pub highest_rev: Option<Rev>,
}
