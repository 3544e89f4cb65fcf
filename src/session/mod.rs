//! Per-folder sync sessions.
//!
//! A [`SyncSession`] decides when protocol commands for one folder are allowed
//! to run. Commands gate themselves on the session (see
//! [`SessionGatedCommand`]); the first arrival drives the session through its
//! start sequence (load folder, publish busy indicators, start activity
//! tokens), and once the last registered command finishes the session runs its
//! end sequence (scan for new revisions, advance and commit the watermark,
//! refresh and end activities, clear indicators) and returns to idle.
//!
//! The state machine is cyclic: `None → Starting → Adopting → Active → Ending
//! → None`, observable through a `tokio::sync::watch` channel. All mutable
//! session state lives behind one mutex that is never held across an await.

pub mod cursor;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::activity::backend::ActivityBackend;
use crate::activity::set::{ActivitySet, ActivitySetStatus};
use crate::activity::{ActivityPurpose, ActivitySpec, EndAction};
use crate::command::{CancelReason, Command, CommandId, CommandPriority};
use crate::error::{ErrorInfo, MailError, Result};
use crate::progress::{ProgressReporter, SyncPhase, SyncStateRecord};
use crate::session::cursor::SyncCursor;
use crate::store::SyncStore;
use crate::types::{AccountId, FolderId, FolderStatus, FolderSyncStatus, Rev};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Not running; the next registered command starts it.
    None,
    /// Loading folder state and publishing busy indicators.
    Starting,
    /// Creating/adopting activity tokens.
    Adopting,
    /// Commands may run.
    Active,
    /// Scanning changes, committing the watermark, ending activities.
    Ending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Most recent command failures retained for diagnostics.
    pub max_failure_records: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_failure_records: 10 }
    }
}

/// One retained command failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFailure {
    pub id: CommandId,
    pub error: ErrorInfo,
}

/// Diagnostics snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub folder_id: FolderId,
    pub state: SessionState,
    pub activities: ActivitySetStatus,
    pub waiting: Vec<CommandId>,
    pub ready: Vec<CommandId>,
    pub failed: Vec<CommandFailure>,
    pub last_error: Option<ErrorInfo>,
}

struct SessionInner {
    state: SessionState,
    /// Folder metadata was loaded this run; cleanup can commit.
    found_folder: bool,
    initial_sync: bool,
    cursor: SyncCursor,
    /// Commands registered but not yet allowed to run.
    waiting: HashSet<CommandId>,
    /// Commands allowed to run; the session ends when this drains.
    ready: HashSet<CommandId>,
    /// Waiting commands failed by a session error, keyed for pickup by their
    /// gate future.
    aborted: HashMap<CommandId, MailError>,
    failed: VecDeque<CommandFailure>,
    last_error: Option<ErrorInfo>,
    stop_requested: bool,
    start_requested: bool,
    account_spinner: bool,
    folder_spinner: bool,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::None,
            found_folder: false,
            initial_sync: false,
            cursor: SyncCursor::default(),
            waiting: HashSet::new(),
            ready: HashSet::new(),
            aborted: HashMap::new(),
            failed: VecDeque::new(),
            last_error: None,
            stop_requested: false,
            start_requested: false,
            account_spinner: false,
            folder_spinner: false,
        }
    }
}

/// Sync session for one folder. Shared as `Arc<SyncSession>`.
pub struct SyncSession {
    account_id: AccountId,
    folder_id: FolderId,
    config: SessionConfig,
    store: Arc<dyn SyncStore>,
    backend: Arc<dyn ActivityBackend>,
    progress: Arc<dyn ProgressReporter>,
    /// Tokens owned by the running session.
    activities: ActivitySet,
    /// Tokens handed over while a session is already past adoption; they join
    /// the live set at the next start.
    queued_activities: ActivitySet,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
}

impl SyncSession {
    pub fn new(
        account_id: AccountId,
        folder_id: FolderId,
        config: SessionConfig,
        store: Arc<dyn SyncStore>,
        backend: Arc<dyn ActivityBackend>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::None);
        Arc::new(Self {
            account_id,
            folder_id,
            config,
            store,
            backend,
            progress,
            activities: ActivitySet::new(),
            queued_activities: ActivitySet::new(),
            inner: Mutex::new(SessionInner::new()),
            state_tx,
        })
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn folder_id(&self) -> &FolderId {
        &self.folder_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    /// Observe state transitions, including the cyclic return to `None`.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Committed-or-pending watermark of the current run. Meaningful only
    /// while the session is past `Starting`.
    pub fn last_sync_rev(&self) -> Option<Rev> {
        self.inner.lock().unwrap().cursor.last_sync_rev()
    }

    pub fn is_initial_sync(&self) -> bool {
        self.inner.lock().unwrap().initial_sync
    }

    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.inner.lock().unwrap().last_error.clone()
    }

    /// Record revisions written by this session's own store operations so the
    /// end-of-session scan does not mistake them for external changes.
    pub fn add_put_response_revs(&self, revs: &[Rev]) {
        self.inner.lock().unwrap().cursor.add_put_response_revs(revs);
    }

    /// Raise the self-write high-water mark without tracking individual revs.
    pub fn set_next_sync_rev(&self, rev: Rev) {
        self.inner.lock().unwrap().cursor.set_next_sync_rev(rev);
    }

    /// Hand an activity token to the session. It joins the live set only
    /// while the session is idle; once a start is underway the live set may
    /// already have been snapshotted for creation, so the token is queued and
    /// joins at the next start.
    pub fn adopt_activity(&self, spec: ActivitySpec) {
        // The inner lock is held across the add so the decision cannot race
        // with the state transition out of `None`.
        let inner = self.inner.lock().unwrap();
        if inner.state == SessionState::None {
            self.activities.add(spec);
        } else {
            self.queued_activities.add(spec);
        }
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().unwrap();
        SessionStatus {
            folder_id: self.folder_id.clone(),
            state: inner.state,
            activities: self.activities.status(),
            waiting: inner.waiting.iter().copied().collect(),
            ready: inner.ready.iter().copied().collect(),
            failed: inner.failed.iter().cloned().collect(),
            last_error: inner.last_error.clone(),
        }
    }

    /// Run one sync pass with no commands attached: start, then end as soon
    /// as the session is active (unless commands registered in the meantime,
    /// in which case they keep it open). No-op unless the session is idle.
    pub async fn request_start(&self) {
        let drive = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == SessionState::None {
                inner.state = SessionState::Starting;
                true
            } else {
                false
            }
        };
        if !drive {
            return;
        }
        self.state_tx.send_replace(SessionState::Starting);
        self.drive_start().await;

        let end_now = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == SessionState::Active && inner.ready.is_empty() {
                inner.state = SessionState::Ending;
                true
            } else {
                false
            }
        };
        if end_now {
            self.drive_end().await;
        }
    }

    /// Register a command and wait until the session allows it to run.
    ///
    /// The first command to arrive at an idle session drives the whole start
    /// sequence before returning. Returns an error when the session fails to
    /// start, in which case the command never became ready.
    pub async fn wait_until_ready(&self, id: CommandId) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        let drive = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                SessionState::Active => {
                    inner.ready.insert(id);
                    return Ok(());
                }
                SessionState::None => {
                    inner.waiting.insert(id);
                    inner.state = SessionState::Starting;
                    true
                }
                SessionState::Ending => {
                    inner.waiting.insert(id);
                    inner.start_requested = true;
                    false
                }
                _ => {
                    inner.waiting.insert(id);
                    false
                }
            }
        };

        if drive {
            self.state_tx.send_replace(SessionState::Starting);
            self.drive_start().await;
        }

        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.ready.contains(&id) {
                    return Ok(());
                }
                if let Some(err) = inner.aborted.remove(&id) {
                    return Err(err);
                }
            }
            if rx.changed().await.is_err() {
                return Err(MailError::internal("sync session dropped"));
            }
        }
    }

    /// A ready command finished. The last one out triggers the end sequence.
    pub async fn command_completed(&self, id: CommandId) {
        let end_now = {
            let mut inner = self.inner.lock().unwrap();
            inner.waiting.remove(&id);
            inner.ready.remove(&id);
            if inner.state == SessionState::Active && inner.ready.is_empty() {
                inner.state = SessionState::Ending;
                true
            } else {
                false
            }
        };
        if end_now {
            self.drive_end().await;
        }
    }

    /// A ready command failed. Recorded, then treated as completed.
    pub async fn command_failed(&self, id: CommandId, err: &MailError) {
        warn!(folder = %self.folder_id, command = %id, error = %err, "command failed in session");
        {
            let mut inner = self.inner.lock().unwrap();
            inner.last_error = Some(err.info());
            inner.failed.push_back(CommandFailure { id, error: err.info() });
            while inner.failed.len() > self.config.max_failure_records {
                inner.failed.pop_front();
            }
        }
        self.command_completed(id).await;
    }

    /// Ask the session to stop.
    ///
    /// Idle sessions confirm immediately. An active session with no running
    /// commands ends now; with running commands the request is a caller
    /// contract violation and is rejected without touching them. A session in
    /// a transition phase records the request and honors it on reaching
    /// `Active`: commands still waiting at the gate are failed rather than
    /// run. While ending, the request only suppresses the session's own
    /// restart.
    pub async fn request_stop(&self) -> Result<()> {
        enum StopAction {
            AlreadyStopped,
            EndNow,
            Deferred,
        }

        let action = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                SessionState::None => StopAction::AlreadyStopped,
                SessionState::Active => {
                    if inner.ready.is_empty() {
                        inner.stop_requested = true;
                        inner.state = SessionState::Ending;
                        StopAction::EndNow
                    } else {
                        return Err(MailError::internal(
                            "cannot stop a sync session with running commands",
                        ));
                    }
                }
                _ => {
                    inner.stop_requested = true;
                    StopAction::Deferred
                }
            }
        };

        match action {
            StopAction::AlreadyStopped => {
                // Confirm to anyone awaiting the stopped notification.
                self.state_tx.send_replace(SessionState::None);
            }
            StopAction::EndNow => self.drive_end().await,
            StopAction::Deferred => {}
        }
        Ok(())
    }

    /// Resolve once the session is idle.
    pub async fn wait_stopped(&self) {
        let mut rx = self.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == SessionState::None {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        self.inner.lock().unwrap().state = state;
        self.state_tx.send_replace(state);
    }

    fn drive_start<'a>(&'a self) -> BoxFuture<'a, ()> {
        async move {
            debug!(folder = %self.folder_id, "starting sync session");
            match self.start_inner().await {
                Ok(deferred_stop) => {
                    let end_now = deferred_stop && {
                        let mut inner = self.inner.lock().unwrap();
                        if inner.ready.is_empty() {
                            inner.state = SessionState::Ending;
                            true
                        } else {
                            false
                        }
                    };
                    if end_now {
                        self.drive_end().await;
                    }
                }
                Err(e) => self.handle_error(e, "start").await,
            }
        }
        .boxed()
    }

    /// Start sequence. Returns whether a stop was requested along the way.
    async fn start_inner(&self) -> Result<bool> {
        let folder = self.store.get_folder(&self.folder_id).await?;
        let initial = folder.last_sync_rev.is_none();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.found_folder = true;
            inner.initial_sync = initial;
            inner.cursor = SyncCursor::new(folder.last_sync_rev);
        }

        // Busy indicators: the account-level one only for a first-time sync.
        if initial {
            self.progress
                .update(SyncStateRecord::account(self.account_id.clone(), SyncPhase::InitialSync))
                .await?;
            self.inner.lock().unwrap().account_spinner = true;
        }
        let phase = if initial { SyncPhase::InitialSync } else { SyncPhase::IncrementalSync };
        self.progress
            .update(SyncStateRecord::folder(self.account_id.clone(), self.folder_id.clone(), phase))
            .await?;
        self.inner.lock().unwrap().folder_spinner = true;

        self.set_state(SessionState::Adopting);
        self.queued_activities.pass_to(&self.activities);
        self.activities.start_activities(self.backend.as_ref()).await?;
        if let Some(err) = self.activities.take_error() {
            return Err(err);
        }

        let deferred_stop = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = SessionState::Active;
            if inner.stop_requested {
                // A stop arrived mid-transition. Leave waiting commands
                // unpromoted so the end sequence runs now; they are failed
                // when the session finishes.
                true
            } else {
                let waiting = std::mem::take(&mut inner.waiting);
                inner.ready.extend(waiting);
                false
            }
        };
        self.state_tx.send_replace(SessionState::Active);
        info!(folder = %self.folder_id, initial, "sync session active");
        Ok(deferred_stop)
    }

    fn drive_end<'a>(&'a self) -> BoxFuture<'a, ()> {
        async move {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.state = SessionState::Ending;
            }
            self.state_tx.send_replace(SessionState::Ending);
            debug!(folder = %self.folder_id, "ending sync session");
            match self.end_inner().await {
                Ok(()) => self.finish(None).await,
                Err(e) => {
                    error!(folder = %self.folder_id, error = %e, "sync session end failed");
                    self.inner.lock().unwrap().last_error = Some(e.info());
                    self.finish(Some(e)).await;
                }
            }
        }
        .boxed()
    }

    /// End sequence: scan new revisions, advance and commit the watermark,
    /// refresh watch payloads, end activities.
    async fn end_inner(&self) -> Result<()> {
        let after = self.inner.lock().unwrap().cursor.query_after();
        let mut changes = Vec::new();
        let mut page = None;
        loop {
            let batch = self.store.fetch_changes(&self.folder_id, after, page.take()).await?;
            changes.extend(batch.changes);
            match batch.next_page {
                Some(token) => page = Some(token),
                None => break,
            }
        }

        let (watermark, more) = {
            let mut inner = self.inner.lock().unwrap();
            let set = inner.cursor.classify(&changes);
            let more = inner.cursor.advance(&set);
            (inner.cursor.last_sync_rev(), more)
        };
        if more {
            debug!(folder = %self.folder_id, "external changes present; folder will sync again");
        }

        let watched = !self.activities.names_with_purpose(ActivityPurpose::Watch).is_empty();
        let sync_status =
            if watched { FolderSyncStatus::Push } else { FolderSyncStatus::Scheduled };
        self.store
            .commit_folder(
                &self.folder_id,
                FolderStatus {
                    sync_status,
                    last_sync_rev: watermark,
                    last_sync_time: Utc::now(),
                },
            )
            .await?;
        self.inner.lock().unwrap().cursor.commit_acknowledged();

        // Re-arm watches above the committed watermark.
        if let Some(rev) = watermark {
            for name in self.activities.names_with_purpose(ActivityPurpose::Watch) {
                self.activities.replace(
                    &name,
                    ActivityPurpose::Watch,
                    serde_json::json!({ "folderId": self.folder_id, "rev": rev }),
                );
            }
        }
        self.activities.end_activities(self.backend.as_ref()).await?;
        if let Some(err) = self.activities.take_error() {
            return Err(err);
        }
        Ok(())
    }

    /// Per-state cleanup after a failure. The session always leaves this with
    /// busy indicators cleared and state `None`.
    async fn handle_error(&self, err: MailError, location: &'static str) {
        error!(folder = %self.folder_id, error = %err, location, "sync session error");
        let (state, found) = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_error = Some(err.info());
            (inner.state, inner.found_folder)
        };

        match state {
            SessionState::Starting | SessionState::Adopting if found => {
                // The folder was loaded; commit what was observed and tear
                // down activities the normal way.
                self.set_state(SessionState::Active);
                self.set_state(SessionState::Ending);
                if let Err(e2) = self.end_inner().await {
                    warn!(folder = %self.folder_id, error = %e2, "cleanup after sync error also failed");
                }
            }
            SessionState::Starting | SessionState::Adopting => {
                // Nothing to commit; cancel whatever tokens got created.
                self.activities.set_end_action_all(EndAction::Cancel);
                if let Err(e2) = self.activities.end_activities(self.backend.as_ref()).await {
                    warn!(folder = %self.folder_id, error = %e2, "failed to cancel activities");
                }
                let _ = self.activities.take_error();
            }
            SessionState::Active => {
                self.set_state(SessionState::Ending);
                if let Err(e2) = self.end_inner().await {
                    warn!(folder = %self.folder_id, error = %e2, "cleanup after sync error also failed");
                }
            }
            SessionState::Ending | SessionState::None => {}
        }

        self.finish(Some(err)).await;
    }

    /// Clear indicators (folder first, then account), reset per-run state,
    /// notify stopped, and restart if commands queued up while ending.
    async fn finish(&self, error: Option<MailError>) {
        let (folder_spinner, account_spinner) = {
            let mut inner = self.inner.lock().unwrap();
            (
                std::mem::take(&mut inner.folder_spinner),
                std::mem::take(&mut inner.account_spinner),
            )
        };
        if folder_spinner {
            let phase = if error.is_some() { SyncPhase::Error } else { SyncPhase::Idle };
            if let Err(e) = self
                .progress
                .update(SyncStateRecord::folder(
                    self.account_id.clone(),
                    self.folder_id.clone(),
                    phase,
                ))
                .await
            {
                warn!(folder = %self.folder_id, error = %e, "failed to clear folder sync state");
            }
        }
        if account_spinner {
            if let Err(e) = self
                .progress
                .update(SyncStateRecord::account(self.account_id.clone(), SyncPhase::Idle))
                .await
            {
                warn!(account = %self.account_id, error = %e, "failed to clear account sync state");
            }
        }

        let restart = {
            let mut inner = self.inner.lock().unwrap();
            inner.cursor.reset();
            inner.ready.clear();
            inner.found_folder = false;
            inner.initial_sync = false;
            if let Some(err) = &error {
                // Waiting commands can never become ready now; fail them.
                let waiting: Vec<CommandId> = inner.waiting.drain().collect();
                for id in waiting {
                    inner.aborted.insert(id, err.clone());
                }
            } else if inner.stop_requested {
                let waiting: Vec<CommandId> = inner.waiting.drain().collect();
                for id in waiting {
                    inner.aborted.insert(
                        id,
                        MailError::internal("sync session stopped before command could run"),
                    );
                }
            }
            let restart = error.is_none()
                && !inner.stop_requested
                && (inner.start_requested || !inner.waiting.is_empty());
            inner.start_requested = false;
            inner.stop_requested = false;
            inner.state = if restart { SessionState::Starting } else { SessionState::None };
            restart
        };

        if restart {
            debug!(folder = %self.folder_id, "commands queued while ending; restarting session");
            self.state_tx.send_replace(SessionState::Starting);
            self.drive_start().await;
        } else {
            self.state_tx.send_replace(SessionState::None);
            info!(folder = %self.folder_id, "sync session stopped");
        }
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("folder_id", &self.folder_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Wrapper that holds a command at the gate until its session is active, and
/// reports the outcome back to the session when the command finishes.
pub struct SessionGatedCommand {
    session: Arc<SyncSession>,
    gate_id: CommandId,
    inner: Box<dyn Command>,
}

impl SessionGatedCommand {
    pub fn new(session: Arc<SyncSession>, inner: Box<dyn Command>) -> Box<Self> {
        Box::new(Self { session, gate_id: CommandId::generate(), inner })
    }
}

#[async_trait]
impl Command for SessionGatedCommand {
    fn describe(&self) -> String {
        format!("{} [folder {}]", self.inner.describe(), self.session.folder_id())
    }

    fn priority(&self) -> CommandPriority {
        self.inner.priority()
    }

    async fn run(&mut self) -> Result<()> {
        self.session.wait_until_ready(self.gate_id).await?;
        let result = self.inner.run().await;
        match &result {
            Ok(()) => self.session.command_completed(self.gate_id).await,
            Err(err) => self.session.command_failed(self.gate_id, err).await,
        }
        result
    }

    fn cancel(&mut self, reason: CancelReason) -> bool {
        self.inner.cancel(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::backend::{ActivityId, StartOutcome};
    use crate::store::MemoryStore;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
        seq: AtomicU64,
        /// When set, each `create` call consumes a permit before proceeding.
        create_gate: Option<Arc<Semaphore>>,
    }

    impl RecordingBackend {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ActivityBackend for RecordingBackend {
        async fn create(&self, spec: &ActivitySpec) -> Result<StartOutcome> {
            if let Some(gate) = &self.create_gate {
                let permit =
                    gate.acquire().await.map_err(|_| MailError::internal("gate closed"))?;
                permit.forget();
            }
            self.record(format!("create:{}", spec.name));
            let id = self.seq.fetch_add(1, Ordering::SeqCst);
            Ok(StartOutcome { id: ActivityId(format!("act-{id}")), started: true })
        }

        async fn adopt(&self, id: &ActivityId) -> Result<StartOutcome> {
            self.record(format!("adopt:{id}"));
            Ok(StartOutcome { id: id.clone(), started: true })
        }

        async fn update(&self, id: &ActivityId, _payload: Value) -> Result<()> {
            self.record(format!("update:{id}"));
            Ok(())
        }

        async fn complete(&self, id: &ActivityId, restart: Option<Value>) -> Result<()> {
            let suffix = if restart.is_some() { ":restart" } else { "" };
            self.record(format!("complete:{id}{suffix}"));
            Ok(())
        }

        async fn cancel(&self, id: &ActivityId) -> Result<()> {
            self.record(format!("cancel:{id}"));
            Ok(())
        }

        async fn cancel_named(&self, name: &str) -> Result<()> {
            self.record(format!("cancel_named:{name}"));
            Ok(())
        }

        async fn unsubscribe(&self, id: &ActivityId) -> Result<()> {
            self.record(format!("unsubscribe:{id}"));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        records: Mutex<Vec<SyncStateRecord>>,
    }

    #[async_trait]
    impl ProgressReporter for RecordingProgress {
        async fn update(&self, record: SyncStateRecord) -> Result<()> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        backend: Arc<RecordingBackend>,
        progress: Arc<RecordingProgress>,
        session: Arc<SyncSession>,
    }

    fn fixture() -> Fixture {
        fixture_with_backend(RecordingBackend::default())
    }

    fn fixture_with_backend(backend: RecordingBackend) -> Fixture {
        let account = AccountId::new("acct-1");
        let folder = FolderId::new("inbox");
        let store = Arc::new(MemoryStore::new());
        store.add_folder(&account, &folder, "INBOX");
        let backend = Arc::new(backend);
        let progress = Arc::new(RecordingProgress::default());
        let session = SyncSession::new(
            account,
            folder,
            SessionConfig::default(),
            store.clone(),
            backend.clone(),
            progress.clone(),
        );
        Fixture { store, backend, progress, session }
    }

    async fn commit_watermark(store: &MemoryStore, folder: &FolderId, rev: Rev) {
        store
            .commit_folder(
                folder,
                FolderStatus {
                    sync_status: FolderSyncStatus::Scheduled,
                    last_sync_rev: Some(rev),
                    last_sync_time: Utc::now(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_command_starts_session_and_last_ends_it() {
        let f = fixture();
        let folder = f.session.folder_id().clone();
        commit_watermark(&f.store, &folder, 5).await;

        let id = CommandId::generate();
        f.session.wait_until_ready(id).await.unwrap();
        assert_eq!(f.session.state(), SessionState::Active);
        assert!(!f.session.is_initial_sync());

        f.session.command_completed(id).await;
        assert_eq!(f.session.state(), SessionState::None);
        // Empty scan still commits: the watermark survives.
        assert_eq!(f.store.folder_watermark(&folder), Some(5));
    }

    #[tokio::test]
    async fn command_less_start_runs_one_full_pass() {
        let f = fixture();
        let folder = f.session.folder_id().clone();
        commit_watermark(&f.store, &folder, 3).await;

        f.session.request_start().await;
        assert_eq!(f.session.state(), SessionState::None);
        assert_eq!(f.store.folder_watermark(&folder), Some(3));
    }

    #[tokio::test]
    async fn initial_sync_publishes_account_and_folder_indicators() {
        let f = fixture();
        let id = CommandId::generate();
        f.session.wait_until_ready(id).await.unwrap();
        assert!(f.session.is_initial_sync());
        f.session.command_completed(id).await;

        let records = f.progress.records.lock().unwrap().clone();
        let phases: Vec<(bool, SyncPhase)> =
            records.iter().map(|r| (r.folder_id.is_some(), r.phase)).collect();
        assert_eq!(
            phases,
            vec![
                (false, SyncPhase::InitialSync),
                (true, SyncPhase::InitialSync),
                (true, SyncPhase::Idle),
                (false, SyncPhase::Idle),
            ]
        );
        // Initial sync done; the folder now has a watermark.
        assert!(f.store.folder_watermark(f.session.folder_id()).is_some());
    }

    #[tokio::test]
    async fn own_writes_advance_watermark_without_resync() {
        let f = fixture();
        let folder = f.session.folder_id().clone();
        commit_watermark(&f.store, &folder, 100).await;
        f.store.put_object_at_rev(&folder, "a", 101);
        f.store.put_object_at_rev(&folder, "b", 105);

        let id = CommandId::generate();
        f.session.wait_until_ready(id).await.unwrap();
        // The command wrote both objects itself.
        f.session.add_put_response_revs(&[101, 105]);
        f.session.command_completed(id).await;

        assert_eq!(f.store.folder_watermark(&folder), Some(105));
    }

    #[tokio::test]
    async fn external_change_parks_watermark_for_rescan() {
        let f = fixture();
        let folder = f.session.folder_id().clone();
        commit_watermark(&f.store, &folder, 100).await;
        f.store.put_object_at_rev(&folder, "ext", 103);

        let id = CommandId::generate();
        f.session.wait_until_ready(id).await.unwrap();
        f.session.command_completed(id).await;

        // The unprocessed change at 103 stays above the watermark.
        assert_eq!(f.store.folder_watermark(&folder), Some(102));
    }

    #[tokio::test]
    async fn stop_with_running_commands_is_rejected() {
        let f = fixture();
        let id = CommandId::generate();
        f.session.wait_until_ready(id).await.unwrap();

        let err = f.session.request_stop().await.unwrap_err();
        assert!(matches!(err, MailError::Internal(_)));
        assert_eq!(f.session.state(), SessionState::Active);

        f.session.command_completed(id).await;
        assert_eq!(f.session.state(), SessionState::None);
    }

    #[tokio::test]
    async fn stop_from_idle_confirms_immediately() {
        let f = fixture();
        f.session.request_stop().await.unwrap();
        assert_eq!(f.session.state(), SessionState::None);
        f.session.wait_stopped().await;
    }

    #[tokio::test]
    async fn commit_failure_leaves_stored_watermark_and_records_error() {
        let f = fixture();
        let folder = f.session.folder_id().clone();
        commit_watermark(&f.store, &folder, 50).await;
        f.store.fail_next_commit(MailError::ConnectionFailed("store down".into()));

        let id = CommandId::generate();
        f.session.wait_until_ready(id).await.unwrap();
        f.session.add_put_response_revs(&[51]);
        f.store.put_object_at_rev(&folder, "a", 51);
        f.session.command_completed(id).await;

        assert_eq!(f.session.state(), SessionState::None);
        assert_eq!(f.store.folder_watermark(&folder), Some(50));
        let err = f.session.last_error().unwrap();
        assert!(err.code().is_connection_error());
    }

    #[tokio::test]
    async fn missing_folder_fails_the_gated_command() {
        let f = fixture();
        let missing = SyncSession::new(
            AccountId::new("acct-1"),
            FolderId::new("no-such-folder"),
            SessionConfig::default(),
            f.store.clone(),
            f.backend.clone(),
            f.progress.clone(),
        );

        let id = CommandId::generate();
        let err = missing.wait_until_ready(id).await.unwrap_err();
        assert!(matches!(err, MailError::FolderNotFound(_)));
        assert_eq!(missing.state(), SessionState::None);
        // No indicators were left behind.
        assert!(f.progress.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn watch_activity_is_rearmed_with_committed_watermark() {
        let f = fixture();
        let folder = f.session.folder_id().clone();
        commit_watermark(&f.store, &folder, 7).await;
        f.session.adopt_activity(
            ActivitySpec::new("inbox-watch", ActivityPurpose::Watch)
                .with_payload(serde_json::json!({ "rev": 7 })),
        );

        let id = CommandId::generate();
        f.session.wait_until_ready(id).await.unwrap();
        f.session.command_completed(id).await;

        let calls = f.backend.calls();
        assert!(calls.contains(&"create:inbox-watch".to_string()));
        assert!(calls.iter().any(|c| c.ends_with(":restart")), "{calls:?}");
        // Watched folders commit as push-synced.
        let record = f.store.get_folder(&folder).await.unwrap();
        assert_eq!(record.last_sync_rev, Some(7));
    }

    #[tokio::test]
    async fn activity_adopted_mid_start_joins_the_next_run() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture_with_backend(RecordingBackend {
            create_gate: Some(gate.clone()),
            ..Default::default()
        });
        let folder = f.session.folder_id().clone();
        commit_watermark(&f.store, &folder, 5).await;
        f.session.adopt_activity(ActivitySpec::new("early", ActivityPurpose::Generic));

        let id = CommandId::generate();
        let session = f.session.clone();
        let driver = tokio::spawn(async move { session.wait_until_ready(id).await });
        while f.session.state() != SessionState::Adopting {
            tokio::task::yield_now().await;
        }

        // The live set was already snapshotted for creation; this token must
        // wait for the next run rather than silently vanish at end-of-session.
        f.session.adopt_activity(ActivitySpec::new("late", ActivityPurpose::Generic));

        gate.add_permits(2);
        driver.await.unwrap().unwrap();
        f.session.command_completed(id).await;
        assert_eq!(f.session.state(), SessionState::None);
        assert!(!f.backend.calls().contains(&"create:late".to_string()));

        f.session.request_start().await;
        assert!(f.backend.calls().contains(&"create:late".to_string()));
    }

    #[tokio::test]
    async fn stop_during_start_ends_without_running_waiting_commands() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture_with_backend(RecordingBackend {
            create_gate: Some(gate.clone()),
            ..Default::default()
        });
        let folder = f.session.folder_id().clone();
        commit_watermark(&f.store, &folder, 5).await;
        f.session.adopt_activity(ActivitySpec::new("keepalive", ActivityPurpose::Generic));

        let id = CommandId::generate();
        let session = f.session.clone();
        let driver = tokio::spawn(async move { session.wait_until_ready(id).await });
        while f.session.state() != SessionState::Adopting {
            tokio::task::yield_now().await;
        }

        f.session.request_stop().await.unwrap();
        gate.add_permits(1);

        let err = driver.await.unwrap().unwrap_err();
        assert!(matches!(err, MailError::Internal(_)));
        assert_eq!(f.session.state(), SessionState::None);
        // The end sequence still ran: the watermark was committed and the
        // activity released.
        assert_eq!(f.store.folder_watermark(&folder), Some(5));
        assert!(f.backend.calls().iter().any(|c| c.starts_with("unsubscribe:")));
    }

    #[tokio::test]
    async fn gated_command_runs_only_after_session_is_active() {
        let f = fixture();
        commit_watermark(&f.store, f.session.folder_id(), 1).await;

        struct ProbeCommand {
            session: Arc<SyncSession>,
            observed: Arc<Mutex<Option<SessionState>>>,
        }

        #[async_trait]
        impl Command for ProbeCommand {
            fn describe(&self) -> String {
                "probe".into()
            }

            async fn run(&mut self) -> Result<()> {
                *self.observed.lock().unwrap() = Some(self.session.state());
                Ok(())
            }
        }

        let observed = Arc::new(Mutex::new(None));
        let mut gated = SessionGatedCommand::new(
            f.session.clone(),
            Box::new(ProbeCommand { session: f.session.clone(), observed: observed.clone() }),
        );
        gated.run().await.unwrap();

        assert_eq!(*observed.lock().unwrap(), Some(SessionState::Active));
        // The wrapper reported completion; the session ended itself.
        assert_eq!(f.session.state(), SessionState::None);
    }
}
