//! Account records and the account-service RPC seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorInfo, Result};
use crate::types::AccountId;

/// Retry bookkeeping persisted on the account so backoff state survives a
/// process restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStatus {
    /// Current backoff interval in seconds; 0 when no retry is outstanding.
    pub interval_secs: u64,
    /// Consecutive transient failures since the last successful sync.
    pub count: u32,
    /// Failure that triggered the retry, for display.
    pub reason: Option<ErrorInfo>,
}

impl RetryStatus {
    pub fn is_idle(&self) -> bool {
        self.interval_secs == 0 && self.count == 0
    }
}

/// Account data needed by the engine, fetched from the sibling account service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub display_name: String,
    /// Most recent sync error, for UI display. Cleared on success.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub retry: RetryStatus,
}

/// RPC seam to the sibling account service.
///
/// Replies arrive asynchronously; every call may fail with a connection-class
/// error when the bus is unavailable.
#[async_trait]
pub trait AccountService: Send + Sync {
    /// Load account data. Fails with `AccountMisconfigured` when the account
    /// does not exist or cannot be decoded.
    async fn get_account(&self, id: &AccountId) -> Result<AccountRecord>;

    /// Tear down synced data for a disabled account (local mail, watches).
    async fn disable_account_data(&self, id: &AccountId) -> Result<()>;

    /// Remove all traces of a deleted account.
    async fn delete_account_data(&self, id: &AccountId) -> Result<()>;
}
