//! Mail synchronization session engine.
//!
//! This crate implements the account- and folder-level machinery that decides
//! what sync work is legal to run at any given moment: per-folder sync sessions
//! with revision-cursor bookkeeping, a priority command queue with a concurrency
//! bound, activity-token lifecycle grouping for the host scheduler, and
//! exponential-backoff retry on transient failures.
//!
//! Wire protocols (IMAP/POP/SMTP), the persistent store, and the activity
//! scheduler backend are collaborators reached through traits; see
//! [`store::SyncStore`], [`activity::backend::ActivityBackend`],
//! [`account::AccountService`] and [`progress::ProgressReporter`].

pub mod account;
pub mod activity;
pub mod client;
pub mod command;
pub mod error;
pub mod progress;
pub mod retry;
pub mod session;
pub mod store;
pub mod types;

pub use client::{AccountClient, AccountClientConfig, ClientState};
pub use command::manager::{CommandManager, CommandManagerConfig};
pub use command::{CancelReason, Command, CommandId, CommandPriority};
pub use error::{ErrorCode, ErrorInfo, MailError, Result};
pub use retry::{RetryCoordinator, RetryPolicy};
pub use session::{SessionConfig, SessionGatedCommand, SessionState, SyncSession};
pub use store::{MemoryStore, SyncStore};
