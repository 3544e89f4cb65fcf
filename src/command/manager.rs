//! Command admission, queueing, and bounded concurrent execution.
//!
//! The manager owns pending commands and runs up to a fixed number
//! concurrently. Exceeding the limit defers promotion; it never rejects.
//! Pausing stops promotion of pending commands without touching the ones
//! already running. Completed commands are handed back to listeners through a
//! completion channel together with their result.

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::command::{
    CancelReason, Command, CommandEvent, CommandId, CommandRecord, CommandState,
};
use crate::error::MailError;

/// Default number of concurrently running commands.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandManagerConfig {
    pub max_concurrent: usize,
    /// Start with promotion disabled; the owner resumes once it is ready to
    /// run work (e.g. account data loaded).
    pub start_paused: bool,
}

impl Default for CommandManagerConfig {
    fn default() -> Self {
        Self { max_concurrent: DEFAULT_MAX_CONCURRENT, start_paused: false }
    }
}

/// Diagnostics snapshot of the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandManagerStatus {
    pub paused: bool,
    pub pending: Vec<CommandRecord>,
    pub active: Vec<CommandRecord>,
}

struct PendingEntry {
    seq: u64,
    record: CommandRecord,
    command: Box<dyn Command>,
}

struct ManagerInner {
    config: CommandManagerConfig,
    paused: bool,
    next_seq: u64,
    pending: Vec<PendingEntry>,
    active: HashMap<CommandId, CommandRecord>,
}

/// Shared handle to a command queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct CommandManager {
    inner: Arc<Mutex<ManagerInner>>,
    events_tx: flume::Sender<CommandEvent>,
    events_rx: flume::Receiver<CommandEvent>,
}

impl CommandManager {
    pub fn new(config: CommandManagerConfig) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let paused = config.start_paused;
        Self {
            inner: Arc::new(Mutex::new(ManagerInner {
                config,
                paused,
                next_seq: 0,
                pending: Vec::new(),
                active: HashMap::new(),
            })),
            events_tx,
            events_rx,
        }
    }

    /// Completion events, in finish order. Each event carries the finished
    /// command back to the caller.
    pub fn events(&self) -> flume::Receiver<CommandEvent> {
        self.events_rx.clone()
    }

    /// Append a command to the pending queue. With `run_immediately` set, the
    /// queue is re-evaluated right away; otherwise the command waits for the
    /// next promotion pass.
    pub fn queue(&self, command: Box<dyn Command>, run_immediately: bool) -> CommandId {
        let id = CommandId::generate();
        {
            let mut inner = self.inner.lock().unwrap();
            let record = CommandRecord::new(id, command.describe(), command.priority());
            debug!(command = %record.describe, %id, "queueing command");
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.pending.push(PendingEntry { seq, record, command });
        }
        if run_immediately {
            self.promote();
        }
        id
    }

    /// Run a command immediately, bypassing the queue and the concurrency
    /// limit. Reserved for administrative operations that must not wait
    /// behind protocol work.
    pub fn run_now(&self, command: Box<dyn Command>) -> CommandId {
        let id = CommandId::generate();
        let mut record = CommandRecord::new(id, command.describe(), command.priority());
        record.state = CommandState::Running;
        record.started_at = Some(Utc::now());
        {
            let mut inner = self.inner.lock().unwrap();
            inner.active.insert(id, record);
        }
        self.spawn_run(id, command);
        id
    }

    /// Stop promoting pending commands. Running commands are unaffected.
    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    /// Re-enable promotion and immediately fill free slots.
    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
        self.promote();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    /// Sweep the pending (not yet started) queue, asking each command to
    /// cancel. Commands that accept are discarded with `reason`; a command
    /// may decline and stay queued. Returns the number cancelled.
    pub fn cancel_pending(&self, reason: CancelReason) -> usize {
        let cancelled: Vec<(CommandRecord, Box<dyn Command>)> = {
            let mut inner = self.inner.lock().unwrap();
            let mut kept = Vec::new();
            let mut cancelled = Vec::new();
            for mut entry in inner.pending.drain(..) {
                if entry.command.cancel(reason) {
                    entry.record.state = CommandState::Cancelled;
                    entry.record.cancel_reason = Some(reason);
                    entry.record.finished_at = Some(Utc::now());
                    cancelled.push((entry.record, entry.command));
                } else {
                    kept.push(entry);
                }
            }
            inner.pending = kept;
            cancelled
        };

        let count = cancelled.len();
        if count > 0 {
            info!(count, %reason, "cancelled pending commands");
        }
        for (record, command) in cancelled {
            let describe = record.describe.clone();
            let _ = self.events_tx.send(CommandEvent {
                record,
                result: Err(MailError::internal(format!("command '{describe}' cancelled: {reason}"))),
                command,
            });
        }
        count
    }

    pub fn status(&self) -> CommandManagerStatus {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<CommandRecord> =
            inner.pending.iter().map(|e| e.record.clone()).collect();
        pending.sort_by_key(|r| r.created_at);
        CommandManagerStatus {
            paused: inner.paused,
            pending,
            active: inner.active.values().cloned().collect(),
        }
    }

    /// Promote pending commands into free slots: highest priority first, FIFO
    /// within a priority.
    fn promote(&self) {
        loop {
            let (id, command) = {
                let mut inner = self.inner.lock().unwrap();
                if inner.paused
                    || inner.active.len() >= inner.config.max_concurrent
                    || inner.pending.is_empty()
                {
                    break;
                }

                let Some(best) = inner
                    .pending
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, e)| (e.record.priority, std::cmp::Reverse(e.seq)))
                    .map(|(i, _)| i)
                else {
                    break;
                };
                let mut entry = inner.pending.remove(best);
                entry.record.state = CommandState::Running;
                entry.record.started_at = Some(Utc::now());
                debug!(command = %entry.record.describe, id = %entry.record.id, "running command");
                let id = entry.record.id;
                inner.active.insert(id, entry.record);
                (id, entry.command)
            };
            self.spawn_run(id, command);
        }
    }

    fn spawn_run(&self, id: CommandId, mut command: Box<dyn Command>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(command.run()).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    let describe = command.describe();
                    warn!(command = %describe, "command panicked");
                    Err(MailError::internal(format!("command '{describe}' panicked")))
                }
            };
            manager.finish(id, command, result);
        });
    }

    /// Remove a finished command from active tracking, emit its completion
    /// event, and promote the next pending command(s).
    fn finish(&self, id: CommandId, command: Box<dyn Command>, result: Result<(), MailError>) {
        let record = {
            let mut inner = self.inner.lock().unwrap();
            let mut record = match inner.active.remove(&id) {
                Some(record) => record,
                None => {
                    warn!(%id, "finished command was not in active tracking");
                    CommandRecord::new(id, command.describe(), command.priority())
                }
            };
            record.finished_at = Some(Utc::now());
            match &result {
                Ok(()) => record.state = CommandState::Completed,
                Err(e) => {
                    record.state = CommandState::Failed;
                    record.error = Some(e.info());
                }
            }
            record
        };

        debug!(command = %record.describe, %id, state = ?record.state, "command finished");
        let _ = self.events_tx.send(CommandEvent { record, result, command });
        self.promote();
    }
}

impl Default for CommandManager {
    fn default() -> Self {
        Self::new(CommandManagerConfig::default())
    }
}
