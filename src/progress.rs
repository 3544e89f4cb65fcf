//! Sync-progress ("spinner") reporting.
//!
//! A session publishes busy indicators before entering its active phase and
//! clears them on the way out, so a UI collaborator can show per-account and
//! per-folder sync state. The engine only writes these records; rendering is
//! someone else's problem.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{AccountId, FolderId};

/// Phase published for an account or folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    InitialSync,
    IncrementalSync,
    Error,
}

/// One busy-indicator update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateRecord {
    pub account_id: AccountId,
    /// `None` for an account-level indicator.
    pub folder_id: Option<FolderId>,
    pub phase: SyncPhase,
}

impl SyncStateRecord {
    pub fn account(account_id: AccountId, phase: SyncPhase) -> Self {
        Self { account_id, folder_id: None, phase }
    }

    pub fn folder(account_id: AccountId, folder_id: FolderId, phase: SyncPhase) -> Self {
        Self { account_id, folder_id: Some(folder_id), phase }
    }
}

/// Collaborator that records sync-state indicators.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn update(&self, record: SyncStateRecord) -> Result<()>;
}

/// Reporter that drops all updates. Useful for headless deployments and tests.
#[derive(Debug, Default)]
pub struct NullProgressReporter;

#[async_trait]
impl ProgressReporter for NullProgressReporter {
    async fn update(&self, _record: SyncStateRecord) -> Result<()> {
        Ok(())
    }
}
