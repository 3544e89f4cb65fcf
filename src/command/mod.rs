//! Asynchronous work units.
//!
//! A [`Command`] is one unit of protocol or bookkeeping work. Commands are
//! owned by a [`manager::CommandManager`] queue while pending and running;
//! when one finishes, ownership transfers back to the listener through the
//! completion event so the result can be inspected.

pub mod manager;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorInfo, MailError, Result};

/// Command identifier, unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub Uuid);

impl CommandId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Scheduling priority. High-priority commands are promoted before normal
/// ones; within a priority, arrival order is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    Normal,
    High,
}

/// Lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Completed | CommandState::Failed | CommandState::Cancelled)
    }
}

/// Deterministic reason attached to a cancellation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The owning account entered a terminal disabled/deleted state.
    Shutdown,
    /// Account data could not be obtained.
    NoAccount,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Shutdown => f.write_str("shutdown"),
            CancelReason::NoAccount => f.write_str("no account"),
        }
    }
}

/// One unit of asynchronous work.
///
/// `run` does the work; an error return terminates the command as `Failed`.
/// Cancellation is a request, not a guarantee: a command that has already made
/// an external commitment (e.g. bytes on the wire) may decline by returning
/// `false` from `cancel`.
#[async_trait]
pub trait Command: Send + 'static {
    fn describe(&self) -> String;

    fn priority(&self) -> CommandPriority {
        CommandPriority::Normal
    }

    async fn run(&mut self) -> Result<()>;

    fn cancel(&mut self, reason: CancelReason) -> bool {
        let _ = reason;
        true
    }
}

/// Bookkeeping record for a command across its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: CommandId,
    pub describe: String,
    pub priority: CommandPriority,
    pub state: CommandState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorInfo>,
    pub cancel_reason: Option<CancelReason>,
}

impl CommandRecord {
    pub(crate) fn new(id: CommandId, describe: String, priority: CommandPriority) -> Self {
        Self {
            id,
            describe,
            priority,
            state: CommandState::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            cancel_reason: None,
        }
    }
}

/// Completion event emitted by the manager. Carries the finished command so
/// the listener can inspect its result state.
pub struct CommandEvent {
    pub record: CommandRecord,
    pub result: Result<()>,
    pub command: Box<dyn Command>,
}

impl CommandEvent {
    pub fn id(&self) -> CommandId {
        self.record.id
    }

    pub fn failed_with(&self) -> Option<&MailError> {
        self.result.as_ref().err()
    }
}

impl std::fmt::Debug for CommandEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEvent")
            .field("record", &self.record)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_high_above_normal() {
        assert!(CommandPriority::High > CommandPriority::Normal);
    }

    #[test]
    fn terminal_states() {
        assert!(!CommandState::Created.is_terminal());
        assert!(!CommandState::Running.is_terminal());
        assert!(CommandState::Completed.is_terminal());
        assert!(CommandState::Failed.is_terminal());
        assert!(CommandState::Cancelled.is_terminal());
    }
}
