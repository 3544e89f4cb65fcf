//! Exponential-backoff retry scheduling for transient sync failures.
//!
//! When a folder sync fails with a transient error (connection, SSL, login
//! timeout) the coordinator persists the failure on the account and arms a
//! scheduled-sync activity to try again later. Consecutive failures walk an
//! interval ladder; a successful sync cancels the outstanding retry and resets
//! the ladder. Non-transient failures (bad credentials, configuration) are
//! persisted for display but never retried, since retrying cannot fix them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::account::RetryStatus;
use crate::activity::backend::ActivityBackend;
use crate::activity::{ActivityPurpose, ActivitySpec};
use crate::error::{MailError, Result};
use crate::store::{AccountSyncStatus, SyncStore};
use crate::types::{AccountId, FolderId};

pub const INITIAL_RETRY_SECONDS: u64 = 60;
pub const SECOND_RETRY_SECONDS: u64 = 300;
pub const RETRY_MULTIPLIER: f64 = 1.5;
pub const MAX_RETRY_SECONDS: u64 = 1800;

/// Backoff constants. The defaults match the shipped configuration; embedders
/// can tighten them for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_secs: u64,
    pub second_secs: u64,
    pub multiplier: f64,
    pub max_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_secs: INITIAL_RETRY_SECONDS,
            second_secs: SECOND_RETRY_SECONDS,
            multiplier: RETRY_MULTIPLIER,
            max_secs: MAX_RETRY_SECONDS,
        }
    }
}

impl RetryPolicy {
    /// Next interval after a failure, given the previous interval (0 when no
    /// retry was outstanding). The first two rungs are fixed; beyond them the
    /// interval grows geometrically up to the cap.
    pub fn next_interval(&self, previous_secs: u64) -> u64 {
        if previous_secs < self.initial_secs {
            self.initial_secs
        } else if previous_secs < self.second_secs {
            self.second_secs
        } else if previous_secs >= self.max_secs {
            self.max_secs
        } else {
            self.max_secs.min((previous_secs as f64 * self.multiplier) as u64)
        }
    }
}

/// Per-account retry scheduling. Shared by all of the account's folders; the
/// backoff ladder is account-wide while retry activities are per folder.
pub struct RetryCoordinator {
    account_id: AccountId,
    policy: RetryPolicy,
    store: Arc<dyn SyncStore>,
    backend: Arc<dyn ActivityBackend>,
}

impl RetryCoordinator {
    pub fn new(
        account_id: AccountId,
        policy: RetryPolicy,
        store: Arc<dyn SyncStore>,
        backend: Arc<dyn ActivityBackend>,
    ) -> Self {
        Self { account_id, policy, store, backend }
    }

    /// Scheduler activity name for a folder's retry token. At most one retry
    /// activity exists per folder; re-scheduling replaces it.
    pub fn retry_activity_name(&self, folder: &FolderId) -> String {
        format!("retry-sync:{}:{}", self.account_id, folder)
    }

    /// Record a sync failure and, for transient errors, arm the next retry.
    /// Returns the persisted retry status.
    pub async fn schedule_retry(&self, folder: &FolderId, err: &MailError) -> Result<RetryStatus> {
        let previous = self.store.load_account_status(&self.account_id).await?;

        if !err.is_transient() {
            // Needs user or configuration action; retrying cannot help.
            info!(account = %self.account_id, error = %err, "not scheduling retry for permanent error");
            let status = AccountSyncStatus { error: Some(err.info()), retry: RetryStatus::default() };
            let retry = status.retry.clone();
            self.store.save_account_status(&self.account_id, status).await?;
            return Ok(retry);
        }

        let interval_secs = self.policy.next_interval(previous.retry.interval_secs);
        let retry = RetryStatus {
            interval_secs,
            count: previous.retry.count + 1,
            reason: Some(err.info()),
        };
        info!(
            account = %self.account_id,
            folder = %folder,
            interval_secs,
            attempt = retry.count,
            "scheduling sync retry"
        );
        self.store
            .save_account_status(
                &self.account_id,
                AccountSyncStatus { error: Some(err.info()), retry: retry.clone() },
            )
            .await?;

        let spec = ActivitySpec::new(self.retry_activity_name(folder), ActivityPurpose::ScheduledSync)
            .with_payload(serde_json::json!({
                "folderId": folder,
                "intervalSeconds": interval_secs,
                "attempt": retry.count,
            }))
            .replacing();
        self.backend.create(&spec).await?;
        Ok(retry)
    }

    /// A sync succeeded: cancel the folder's retry activity and reset the
    /// persisted error and backoff state.
    pub async fn clear_retry(&self, folder: &FolderId) -> Result<()> {
        self.backend.cancel_named(&self.retry_activity_name(folder)).await?;

        let status = self.store.load_account_status(&self.account_id).await?;
        if status.error.is_some() || !status.retry.is_idle() {
            debug!(account = %self.account_id, folder = %folder, "clearing retry state");
            self.store
                .save_account_status(&self.account_id, AccountSyncStatus::default())
                .await?;
        }
        Ok(())
    }

    /// Persisted retry status, for orchestrator introspection.
    pub async fn status(&self) -> Result<RetryStatus> {
        Ok(self.store.load_account_status(&self.account_id).await?.retry)
    }
}
