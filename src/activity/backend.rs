//! Scheduler backend seam for activity tokens.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::activity::ActivitySpec;
use crate::error::Result;

/// Scheduler-assigned activity identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(pub String);

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a create or adopt call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub id: ActivityId,
    /// `false` when the scheduler accepted the activity but is holding it
    /// until its requirements (network, schedule) are met.
    pub started: bool,
}

/// Collaborator that talks to the host activity scheduler.
///
/// Every operation is asynchronous; failures are reported as [`crate::error::MailError`]
/// values so an activity-set cycle can capture them without aborting siblings.
#[async_trait]
pub trait ActivityBackend: Send + Sync {
    /// Create a new scheduler activity from `spec`. With `spec.replace` set,
    /// an existing activity of the same name is superseded.
    async fn create(&self, spec: &ActivitySpec) -> Result<StartOutcome>;

    /// Adopt an activity the scheduler created on our behalf.
    async fn adopt(&self, id: &ActivityId) -> Result<StartOutcome>;

    /// Update the activity's payload in place (e.g. refresh a watch record).
    async fn update(&self, id: &ActivityId, payload: Value) -> Result<()>;

    /// Complete the activity. With `restart` set the scheduler immediately
    /// re-arms it with the new payload.
    async fn complete(&self, id: &ActivityId, restart: Option<Value>) -> Result<()>;

    /// Cancel the activity outright.
    async fn cancel(&self, id: &ActivityId) -> Result<()>;

    /// Cancel any scheduler activity with this name, whether or not we hold a
    /// token for it. Used to clear retry activities on successful sync.
    async fn cancel_named(&self, name: &str) -> Result<()>;

    /// Drop our subscription without affecting the scheduler's copy.
    async fn unsubscribe(&self, id: &ActivityId) -> Result<()>;
}
