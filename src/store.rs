//! Persistent-store seam.
//!
//! The engine never talks to a database directly; it goes through
//! [`SyncStore`], which a protocol backend implements against whatever storage
//! it owns. Revision numbers are assigned by the store and are strictly
//! monotonic per folder, which is what makes incremental sync resumable.
//!
//! [`MemoryStore`] is a complete in-memory implementation used by the test
//! suite and by embedders that want an ephemeral engine.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::account::RetryStatus;
use crate::error::{ErrorInfo, MailError, Result};
use crate::types::{
    AccountId, ChangePage, ChangeRecord, FolderId, FolderRecord, FolderStatus, PageToken, Rev,
};

/// Persisted account-level sync status: last error plus retry bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct AccountSyncStatus {
    pub error: Option<ErrorInfo>,
    pub retry: RetryStatus,
}

/// Store collaborator interface.
///
/// All calls are asynchronous and deliver either a payload or a [`MailError`];
/// a store backed by a remote service surfaces connection errors here.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Fetch folder metadata, including the committed sync watermark.
    async fn get_folder(&self, folder: &FolderId) -> Result<FolderRecord>;

    /// All folders belonging to `account`, for account-wide sync.
    async fn list_folders(&self, account: &AccountId) -> Result<Vec<FolderRecord>>;

    /// Query objects in the folder with revision strictly greater than
    /// `after_rev`, in ascending revision order, paginated.
    async fn fetch_changes(
        &self,
        folder: &FolderId,
        after_rev: Rev,
        page: Option<PageToken>,
    ) -> Result<ChangePage>;

    /// Commit the folder's sync status. This is the *only* operation that may
    /// advance the stored watermark; a failure here must leave it untouched.
    async fn commit_folder(&self, folder: &FolderId, status: FolderStatus) -> Result<()>;

    /// Persist account-level error/retry status for UI display and restart
    /// resumability.
    async fn save_account_status(&self, account: &AccountId, status: AccountSyncStatus)
        -> Result<()>;

    /// Reload persisted account-level status (e.g. after process restart).
    async fn load_account_status(&self, account: &AccountId) -> Result<AccountSyncStatus>;
}

const MEMORY_PAGE_SIZE: usize = 100;

#[derive(Debug, Default)]
struct MemoryStoreInner {
    folders: HashMap<FolderId, FolderRecord>,
    /// Per-folder object revisions, id -> rev.
    objects: HashMap<FolderId, HashMap<String, Rev>>,
    account_status: HashMap<AccountId, AccountSyncStatus>,
    next_rev: Rev,
    /// Injectable failure for the next commit, for error-path tests.
    fail_next_commit: Option<MailError>,
}

/// In-memory [`SyncStore`] with store-assigned monotonic revisions.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(MemoryStoreInner { next_rev: 0, ..Default::default() }) }
    }

    /// Create a folder with no sync history (initial-sync state).
    pub fn add_folder(&self, account: &AccountId, folder: &FolderId, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.folders.insert(
            folder.clone(),
            FolderRecord {
                id: folder.clone(),
                account_id: account.clone(),
                name: name.to_string(),
                last_sync_rev: None,
                last_sync_time: None,
            },
        );
        inner.objects.entry(folder.clone()).or_default();
    }

    /// Insert or update objects, assigning fresh revisions. Returns the new
    /// revisions in input order, mirroring a store put/merge response.
    pub fn put_objects(&self, folder: &FolderId, ids: &[&str]) -> Vec<Rev> {
        let mut inner = self.inner.lock().unwrap();
        let mut revs = Vec::with_capacity(ids.len());
        for id in ids {
            inner.next_rev += 1;
            let rev = inner.next_rev;
            inner
                .objects
                .entry(folder.clone())
                .or_default()
                .insert((*id).to_string(), rev);
            revs.push(rev);
        }
        revs
    }

    /// Force a specific revision onto an object, for cursor edge-case tests.
    pub fn put_object_at_rev(&self, folder: &FolderId, id: &str, rev: Rev) {
        let mut inner = self.inner.lock().unwrap();
        inner.objects.entry(folder.clone()).or_default().insert(id.to_string(), rev);
        inner.next_rev = inner.next_rev.max(rev);
    }

    /// Make the next `commit_folder` call fail with `err`.
    pub fn fail_next_commit(&self, err: MailError) {
        self.inner.lock().unwrap().fail_next_commit = Some(err);
    }

    pub fn folder_watermark(&self, folder: &FolderId) -> Option<Rev> {
        let inner = self.inner.lock().unwrap();
        inner.folders.get(folder).and_then(|f| f.last_sync_rev)
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn get_folder(&self, folder: &FolderId) -> Result<FolderRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .folders
            .get(folder)
            .cloned()
            .ok_or_else(|| MailError::FolderNotFound(folder.to_string()))
    }

    async fn list_folders(&self, account: &AccountId) -> Result<Vec<FolderRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut folders: Vec<FolderRecord> =
            inner.folders.values().filter(|f| &f.account_id == account).cloned().collect();
        folders.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(folders)
    }

    async fn fetch_changes(
        &self,
        folder: &FolderId,
        after_rev: Rev,
        page: Option<PageToken>,
    ) -> Result<ChangePage> {
        let inner = self.inner.lock().unwrap();
        let objects = inner
            .objects
            .get(folder)
            .ok_or_else(|| MailError::FolderNotFound(folder.to_string()))?;

        let mut changes: Vec<ChangeRecord> = objects
            .iter()
            .filter(|(_, rev)| **rev > after_rev)
            .map(|(id, rev)| ChangeRecord { id: id.clone(), rev: *rev })
            .collect();
        changes.sort_by_key(|c| c.rev);

        let offset: usize = match page {
            Some(token) => token
                .0
                .parse()
                .map_err(|_| MailError::internal(format!("bad page token: {}", token.0)))?,
            None => 0,
        };

        let remaining = changes.split_off(offset.min(changes.len()));
        let (page_items, rest) = if remaining.len() > MEMORY_PAGE_SIZE {
            let items = remaining[..MEMORY_PAGE_SIZE].to_vec();
            (items, true)
        } else {
            (remaining, false)
        };

        let next_page = rest.then(|| PageToken((offset + MEMORY_PAGE_SIZE).to_string()));
        Ok(ChangePage { changes: page_items, next_page })
    }

    async fn commit_folder(&self, folder: &FolderId, status: FolderStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.fail_next_commit.take() {
            return Err(err);
        }

        let record = inner
            .folders
            .get_mut(folder)
            .ok_or_else(|| MailError::FolderNotFound(folder.to_string()))?;
        if status.last_sync_rev.is_some() {
            record.last_sync_rev = status.last_sync_rev;
        }
        record.last_sync_time = Some(status.last_sync_time);
        Ok(())
    }

    async fn save_account_status(
        &self,
        account: &AccountId,
        status: AccountSyncStatus,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.account_status.insert(account.clone(), status);
        Ok(())
    }

    async fn load_account_status(&self, account: &AccountId) -> Result<AccountSyncStatus> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.account_status.get(account).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ids() -> (AccountId, FolderId) {
        (AccountId::new("acct-1"), FolderId::new("inbox"))
    }

    #[tokio::test]
    async fn revisions_are_monotonic() {
        let (account, folder) = ids();
        let store = MemoryStore::new();
        store.add_folder(&account, &folder, "INBOX");

        let first = store.put_objects(&folder, &["a", "b"]);
        let second = store.put_objects(&folder, &["a"]);
        assert!(second[0] > first[1]);
    }

    #[tokio::test]
    async fn fetch_changes_filters_and_orders_by_rev() {
        let (account, folder) = ids();
        let store = MemoryStore::new();
        store.add_folder(&account, &folder, "INBOX");
        store.put_object_at_rev(&folder, "a", 101);
        store.put_object_at_rev(&folder, "b", 105);
        store.put_object_at_rev(&folder, "c", 99);

        let page = store.fetch_changes(&folder, 100, None).await.unwrap();
        let revs: Vec<Rev> = page.changes.iter().map(|c| c.rev).collect();
        assert_eq!(revs, vec![101, 105]);
        assert!(page.next_page.is_none());
    }

    #[tokio::test]
    async fn commit_failure_leaves_watermark_untouched() {
        let (account, folder) = ids();
        let store = MemoryStore::new();
        store.add_folder(&account, &folder, "INBOX");
        store
            .commit_folder(
                &folder,
                FolderStatus {
                    sync_status: crate::types::FolderSyncStatus::Manual,
                    last_sync_rev: Some(10),
                    last_sync_time: Utc::now(),
                },
            )
            .await
            .unwrap();

        store.fail_next_commit(MailError::ConnectionFailed("store down".into()));
        let err = store
            .commit_folder(
                &folder,
                FolderStatus {
                    sync_status: crate::types::FolderSyncStatus::Manual,
                    last_sync_rev: Some(20),
                    last_sync_time: Utc::now(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(store.folder_watermark(&folder), Some(10));
    }
}
