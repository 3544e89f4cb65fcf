//! Account-level orchestrator.
//!
//! One [`AccountClient`] per mail account ties the pieces together: it owns
//! the command queue, a sync session per folder, and the retry coordinator,
//! and runs the account state machine that decides when queued work may
//! execute. Work arrives at any time; nothing runs until account data has been
//! loaded from the account service, and an account being disabled or deleted
//! drains its sessions before any data is torn down.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::account::{AccountRecord, AccountService, RetryStatus};
use crate::activity::backend::ActivityBackend;
use crate::command::manager::{CommandManager, CommandManagerConfig, CommandManagerStatus};
use crate::command::{CancelReason, Command, CommandEvent, CommandId, CommandState};
use crate::error::{ErrorInfo, MailError, Result};
use crate::progress::ProgressReporter;
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::session::{SessionConfig, SessionGatedCommand, SessionStatus, SyncSession};
use crate::store::SyncStore;
use crate::types::{AccountId, FolderId};

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Idle; no account data, no queued work.
    None,
    /// Work is queued; account data must be loaded before it runs.
    NeedAccount,
    LoadingAccount,
    /// Account data loaded; the command queue is live.
    OkToRunCommands,
    /// Teardown requested; waiting for every session to stop.
    TerminatingSessions,
    DisablingAccount,
    /// Synced data removed; the account can be re-enabled later.
    DisabledAccount,
    DeletingAccount,
    /// All traces removed. Terminal.
    DeletedAccount,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountClientConfig {
    pub manager: CommandManagerConfig,
    pub session: SessionConfig,
    pub retry: RetryPolicy,
}

/// Diagnostics snapshot of the whole account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatus {
    pub account_id: AccountId,
    pub state: ClientState,
    pub manager: CommandManagerStatus,
    pub sessions: Vec<SessionStatus>,
    pub retry: RetryStatus,
    pub last_error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Disable,
    Delete,
}

struct ClientInner {
    state: ClientState,
    account: Option<AccountRecord>,
    sessions: HashMap<FolderId, Arc<SyncSession>>,
    /// Queued command -> folder, for routing completion events to retry
    /// bookkeeping.
    command_folders: HashMap<CommandId, FolderId>,
    load_failures: u32,
    last_error: Option<ErrorInfo>,
}

/// Orchestrator for one account. Shared as `Arc<AccountClient>`.
pub struct AccountClient {
    account_id: AccountId,
    config: AccountClientConfig,
    store: Arc<dyn SyncStore>,
    backend: Arc<dyn ActivityBackend>,
    progress: Arc<dyn ProgressReporter>,
    accounts: Arc<dyn AccountService>,
    manager: CommandManager,
    retry: RetryCoordinator,
    events: flume::Receiver<CommandEvent>,
    inner: Mutex<ClientInner>,
}

impl AccountClient {
    pub fn new(
        account_id: AccountId,
        config: AccountClientConfig,
        store: Arc<dyn SyncStore>,
        backend: Arc<dyn ActivityBackend>,
        progress: Arc<dyn ProgressReporter>,
        accounts: Arc<dyn AccountService>,
    ) -> Arc<Self> {
        // Nothing may run before account data is loaded.
        let mut manager_config = config.manager.clone();
        manager_config.start_paused = true;
        let manager = CommandManager::new(manager_config);
        let events = manager.events();
        let retry = RetryCoordinator::new(
            account_id.clone(),
            config.retry.clone(),
            store.clone(),
            backend.clone(),
        );
        Arc::new(Self {
            account_id,
            config,
            store,
            backend,
            progress,
            accounts,
            manager,
            retry,
            events,
            inner: Mutex::new(ClientInner {
                state: ClientState::None,
                account: None,
                sessions: HashMap::new(),
                command_folders: HashMap::new(),
                load_failures: 0,
                last_error: None,
            }),
        })
    }

    /// Reload status persisted by a previous process, so the UI sees the last
    /// error and retry state straight away.
    pub async fn init(&self) -> Result<()> {
        let status = self.store.load_account_status(&self.account_id).await?;
        let mut inner = self.inner.lock().unwrap();
        inner.last_error = status.error;
        Ok(())
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().unwrap().state
    }

    pub fn manager(&self) -> &CommandManager {
        &self.manager
    }

    /// Account data from the most recent successful load.
    pub fn account(&self) -> Option<AccountRecord> {
        self.inner.lock().unwrap().account.clone()
    }

    /// The folder's session, created on first use.
    pub fn session(&self, folder: &FolderId) -> Arc<SyncSession> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sessions
            .entry(folder.clone())
            .or_insert_with(|| {
                SyncSession::new(
                    self.account_id.clone(),
                    folder.clone(),
                    self.config.session.clone(),
                    self.store.clone(),
                    self.backend.clone(),
                    self.progress.clone(),
                )
            })
            .clone()
    }

    /// Queue a command gated on the folder's session, then drive the state
    /// machine so it runs as soon as account data allows.
    pub async fn queue_folder_command(
        &self,
        folder: &FolderId,
        command: Box<dyn Command>,
    ) -> CommandId {
        let session = self.session(folder);
        let gated = SessionGatedCommand::new(session, command);
        let id = self.manager.queue(gated, false);
        self.inner.lock().unwrap().command_folders.insert(id, folder.clone());
        self.check_queue().await;
        id
    }

    /// Sync one folder. The session start/end sequence does the actual work
    /// (watermark scan, commit, activity refresh); the queued command only
    /// holds the session open.
    pub async fn sync_folder(&self, folder: &FolderId) -> CommandId {
        self.queue_folder_command(folder, Box::new(SyncFolderCommand { folder: folder.clone() }))
            .await
    }

    /// Sync every folder of the account.
    pub async fn sync_account(&self) -> Result<Vec<CommandId>> {
        let folders = self.store.list_folders(&self.account_id).await?;
        let mut ids = Vec::with_capacity(folders.len());
        for folder in folders {
            ids.push(self.sync_folder(&folder.id).await);
        }
        Ok(ids)
    }

    /// Bring an idle client to life (e.g. the account was just created or
    /// re-enabled).
    pub async fn enable_account(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ClientState::None || inner.state == ClientState::DisabledAccount {
                inner.state = ClientState::NeedAccount;
            }
        }
        self.check_queue().await;
    }

    /// Account settings changed; reload before running anything else.
    pub async fn update_account(&self) {
        let reload = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ClientState::OkToRunCommands | ClientState::NeedAccount => {
                    inner.state = ClientState::NeedAccount;
                    true
                }
                _ => false,
            }
        };
        if reload {
            self.manager.pause();
            self.check_queue().await;
        }
    }

    /// Drive the state machine one step. Safe to call at any time.
    pub async fn check_queue(&self) {
        enum Action {
            Load,
            Resume,
            Nothing,
        }

        // The transition to `LoadingAccount` happens under the same lock that
        // picks the action, so two concurrent callers cannot both start a
        // load.
        let action = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ClientState::None => {
                    if self.manager.pending_count() > 0 || self.manager.active_count() > 0 {
                        inner.state = ClientState::LoadingAccount;
                        Action::Load
                    } else {
                        Action::Nothing
                    }
                }
                ClientState::NeedAccount => {
                    inner.state = ClientState::LoadingAccount;
                    Action::Load
                }
                ClientState::OkToRunCommands => Action::Resume,
                _ => Action::Nothing,
            }
        };

        match action {
            Action::Load => self.load_account().await,
            Action::Resume => self.manager.resume(),
            Action::Nothing => {}
        }
    }

    /// Caller must have moved the state to `LoadingAccount` already.
    async fn load_account(&self) {
        debug!(account = %self.account_id, "loading account data");

        match self.accounts.get_account(&self.account_id).await {
            Ok(account) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.account = Some(account);
                    inner.load_failures = 0;
                    inner.state = ClientState::OkToRunCommands;
                }
                info!(account = %self.account_id, "account loaded; command queue live");
                self.manager.resume();
            }
            Err(e) => {
                error!(account = %self.account_id, error = %e, "failed to load account data");
                let failures = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.load_failures += 1;
                    inner.last_error = Some(e.info());
                    inner.state = ClientState::NeedAccount;
                    inner.load_failures
                };
                if failures >= 2 {
                    warn!(account = %self.account_id, "account repeatedly unavailable; dropping queued work");
                    self.manager.cancel_pending(CancelReason::NoAccount);
                    let mut inner = self.inner.lock().unwrap();
                    inner.state = ClientState::None;
                    inner.load_failures = 0;
                }
            }
        }
    }

    /// Stop syncing and remove synced data. The account can be re-enabled.
    pub async fn disable_account(&self) -> Result<()> {
        self.teardown(Teardown::Disable).await
    }

    /// Remove all traces of the account. Terminal once confirmed.
    pub async fn delete_account(&self) -> Result<()> {
        self.teardown(Teardown::Delete).await
    }

    async fn teardown(&self, kind: Teardown) -> Result<()> {
        enum Phase {
            FromScratch,
            ServiceCallOnly,
        }

        let phase = {
            let mut inner = self.inner.lock().unwrap();
            match (inner.state, kind) {
                (ClientState::DisabledAccount, Teardown::Disable) => return Ok(()),
                (ClientState::DeletedAccount, Teardown::Delete) => return Ok(()),
                (ClientState::DeletedAccount, Teardown::Disable) => {
                    return Err(MailError::internal("account already deleted"));
                }
                // Retry a teardown whose service call failed.
                (ClientState::DisablingAccount, Teardown::Disable) => Phase::ServiceCallOnly,
                (ClientState::DeletingAccount, Teardown::Delete) => Phase::ServiceCallOnly,
                (
                    ClientState::TerminatingSessions
                    | ClientState::DisablingAccount
                    | ClientState::DeletingAccount,
                    _,
                ) => {
                    return Err(MailError::internal("account teardown already in progress"));
                }
                _ => {
                    inner.state = ClientState::TerminatingSessions;
                    Phase::FromScratch
                }
            }
        };

        if matches!(phase, Phase::FromScratch) {
            info!(account = %self.account_id, ?kind, "terminating sessions for account teardown");
            self.manager.pause();
            self.manager.cancel_pending(CancelReason::Shutdown);

            let sessions: Vec<Arc<SyncSession>> =
                self.inner.lock().unwrap().sessions.values().cloned().collect();
            for session in sessions {
                if let Err(e) = session.request_stop().await {
                    // Running commands finish on their own and end the session.
                    debug!(folder = %session.folder_id(), error = %e, "waiting for session to drain");
                }
                session.wait_stopped().await;
            }

            self.inner.lock().unwrap().state = match kind {
                Teardown::Disable => ClientState::DisablingAccount,
                Teardown::Delete => ClientState::DeletingAccount,
            };
        }

        let result = match kind {
            Teardown::Disable => self.accounts.disable_account_data(&self.account_id).await,
            Teardown::Delete => self.accounts.delete_account_data(&self.account_id).await,
        };
        match result {
            Ok(()) => {
                let mut inner = self.inner.lock().unwrap();
                inner.state = match kind {
                    Teardown::Disable => ClientState::DisabledAccount,
                    Teardown::Delete => ClientState::DeletedAccount,
                };
                info!(account = %self.account_id, state = ?inner.state, "account teardown complete");
                Ok(())
            }
            Err(e) => {
                error!(account = %self.account_id, error = %e, "account teardown failed");
                self.inner.lock().unwrap().last_error = Some(e.info());
                Err(e)
            }
        }
    }

    /// Process one command completion event: route the outcome to retry
    /// bookkeeping. Intended to be driven in a loop (see
    /// [`AccountClient::spawn_event_pump`]).
    pub async fn pump_one(&self) -> Result<()> {
        let event = self
            .events
            .recv_async()
            .await
            .map_err(|_| MailError::internal("command event channel closed"))?;
        self.handle_event(event).await;
        Ok(())
    }

    async fn handle_event(&self, event: CommandEvent) {
        let folder = self.inner.lock().unwrap().command_folders.remove(&event.id());
        if event.record.state == CommandState::Cancelled {
            debug!(command = %event.record.describe, "command cancelled");
            return;
        }

        match (&event.result, folder) {
            (Ok(()), Some(folder)) => {
                if let Err(e) = self.retry.clear_retry(&folder).await {
                    warn!(folder = %folder, error = %e, "failed to clear retry state");
                }
            }
            (Err(err), Some(folder)) => {
                self.inner.lock().unwrap().last_error = Some(err.info());
                if let Err(e) = self.retry.schedule_retry(&folder, err).await {
                    warn!(folder = %folder, error = %e, "failed to schedule retry");
                }
            }
            (Err(err), None) => {
                self.inner.lock().unwrap().last_error = Some(err.info());
            }
            (Ok(()), None) => {}
        }
    }

    /// Run the event pump until the client is dropped.
    pub fn spawn_event_pump(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while self.pump_one().await.is_ok() {}
        })
    }

    pub async fn status(&self) -> Result<ClientStatus> {
        let retry = self.retry.status().await?;
        let inner = self.inner.lock().unwrap();
        Ok(ClientStatus {
            account_id: self.account_id.clone(),
            state: inner.state,
            manager: self.manager.status(),
            sessions: inner.sessions.values().map(|s| s.status()).collect(),
            retry,
            last_error: inner.last_error.clone(),
        })
    }
}

/// Placeholder work unit that keeps a session open for one sync pass. The
/// session's own start/end sequences perform the sync bookkeeping; protocol
/// backends queue richer commands through
/// [`AccountClient::queue_folder_command`].
struct SyncFolderCommand {
    folder: FolderId,
}

#[async_trait::async_trait]
impl Command for SyncFolderCommand {
    fn describe(&self) -> String {
        format!("sync folder {}", self.folder)
    }

    async fn run(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::backend::{ActivityId, StartOutcome};
    use crate::activity::ActivitySpec;
    use crate::error::ErrorCode;
    use crate::progress::NullProgressReporter;
    use crate::store::{AccountSyncStatus, MemoryStore};
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct SchedulerDouble {
        cancelled_names: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ActivityBackend for SchedulerDouble {
        async fn create(&self, spec: &ActivitySpec) -> Result<StartOutcome> {
            Ok(StartOutcome { id: ActivityId(format!("act-{}", spec.name)), started: true })
        }

        async fn adopt(&self, id: &ActivityId) -> Result<StartOutcome> {
            Ok(StartOutcome { id: id.clone(), started: true })
        }

        async fn update(&self, _id: &ActivityId, _payload: Value) -> Result<()> {
            Ok(())
        }

        async fn complete(&self, _id: &ActivityId, _restart: Option<Value>) -> Result<()> {
            Ok(())
        }

        async fn cancel(&self, _id: &ActivityId) -> Result<()> {
            Ok(())
        }

        async fn cancel_named(&self, name: &str) -> Result<()> {
            self.cancelled_names.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, _id: &ActivityId) -> Result<()> {
            Ok(())
        }
    }

    struct AccountServiceDouble {
        fail_loads: Mutex<u32>,
        calls: Mutex<Vec<String>>,
        /// When set, each `get_account` call consumes a permit after being
        /// recorded and before replying.
        load_gate: Mutex<Option<Arc<Semaphore>>>,
    }

    impl AccountServiceDouble {
        fn new() -> Self {
            Self {
                fail_loads: Mutex::new(0),
                calls: Mutex::new(Vec::new()),
                load_gate: Mutex::new(None),
            }
        }

        fn fail_next_loads(&self, n: u32) {
            *self.fail_loads.lock().unwrap() = n;
        }

        fn hold_loads(&self, gate: Arc<Semaphore>) {
            *self.load_gate.lock().unwrap() = Some(gate);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AccountService for AccountServiceDouble {
        async fn get_account(&self, id: &AccountId) -> Result<AccountRecord> {
            self.calls.lock().unwrap().push("get_account".into());
            let gate = self.load_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                let permit =
                    gate.acquire().await.map_err(|_| MailError::internal("gate closed"))?;
                permit.forget();
            }
            {
                let mut fails = self.fail_loads.lock().unwrap();
                if *fails > 0 {
                    *fails -= 1;
                    return Err(MailError::ConnectionFailed("bus unavailable".into()));
                }
            }
            Ok(AccountRecord {
                id: id.clone(),
                display_name: "Test Account".into(),
                error: None,
                retry: RetryStatus::default(),
            })
        }

        async fn disable_account_data(&self, _id: &AccountId) -> Result<()> {
            self.calls.lock().unwrap().push("disable_account_data".into());
            Ok(())
        }

        async fn delete_account_data(&self, _id: &AccountId) -> Result<()> {
            self.calls.lock().unwrap().push("delete_account_data".into());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        backend: Arc<SchedulerDouble>,
        accounts: Arc<AccountServiceDouble>,
        client: Arc<AccountClient>,
        folder: FolderId,
    }

    fn fixture() -> Fixture {
        let account = AccountId::new("acct-1");
        let folder = FolderId::new("inbox");
        let store = Arc::new(MemoryStore::new());
        store.add_folder(&account, &folder, "INBOX");
        let backend = Arc::new(SchedulerDouble::default());
        let accounts = Arc::new(AccountServiceDouble::new());
        let client = AccountClient::new(
            account,
            AccountClientConfig::default(),
            store.clone(),
            backend.clone(),
            Arc::new(NullProgressReporter),
            accounts.clone(),
        );
        Fixture { store, backend, accounts, client, folder }
    }

    #[tokio::test]
    async fn queued_sync_waits_for_account_load_then_runs() {
        let f = fixture();
        assert_eq!(f.client.state(), ClientState::None);

        f.client.sync_folder(&f.folder).await;
        assert_eq!(f.client.state(), ClientState::OkToRunCommands);
        assert_eq!(f.accounts.calls(), vec!["get_account"]);

        // The command ran, the session committed, and the retry token (if any)
        // was cleared.
        f.client.pump_one().await.unwrap();
        assert!(f.store.folder_watermark(&f.folder).is_some());
        assert!(!f.backend.cancelled_names.lock().unwrap().is_empty());
        assert_eq!(f.client.manager().active_count(), 0);
    }

    #[tokio::test]
    async fn repeated_load_failure_drops_queued_work() {
        let f = fixture();
        f.accounts.fail_next_loads(2);

        f.client.sync_folder(&f.folder).await;
        assert_eq!(f.client.state(), ClientState::NeedAccount);
        assert_eq!(f.client.manager().pending_count(), 1);

        f.client.check_queue().await;
        assert_eq!(f.client.state(), ClientState::None);
        assert_eq!(f.client.manager().pending_count(), 0);

        // The swept command surfaces as a cancelled event.
        f.client.pump_one().await.unwrap();
        let status = f.client.status().await.unwrap();
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry_and_success_clears_it() {
        let f = fixture();

        struct FailingCommand;

        #[async_trait]
        impl Command for FailingCommand {
            fn describe(&self) -> String {
                "fetch mail".into()
            }

            async fn run(&mut self) -> Result<()> {
                Err(MailError::HostNotFound("imap.example.com".into()))
            }
        }

        f.client.queue_folder_command(&f.folder, Box::new(FailingCommand)).await;
        f.client.pump_one().await.unwrap();

        let status = f.client.status().await.unwrap();
        assert_eq!(status.retry.interval_secs, 60);
        assert_eq!(status.retry.count, 1);

        f.client.sync_folder(&f.folder).await;
        f.client.pump_one().await.unwrap();
        let status = f.client.status().await.unwrap();
        assert!(status.retry.is_idle());
        assert!(status.last_error.is_some(), "last error is kept for display until overwritten");
    }

    #[tokio::test]
    async fn disable_then_delete_walks_terminal_states() {
        let f = fixture();
        f.client.sync_folder(&f.folder).await;
        f.client.pump_one().await.unwrap();

        f.client.disable_account().await.unwrap();
        assert_eq!(f.client.state(), ClientState::DisabledAccount);
        assert!(f.client.manager().is_paused());

        f.client.delete_account().await.unwrap();
        assert_eq!(f.client.state(), ClientState::DeletedAccount);
        assert_eq!(
            f.accounts.calls().last().map(String::as_str),
            Some("delete_account_data")
        );

        // Terminal: disabling a deleted account is an error, deleting again is
        // a no-op.
        assert!(f.client.disable_account().await.is_err());
        f.client.delete_account().await.unwrap();
    }

    #[tokio::test]
    async fn enable_from_idle_loads_account_without_queued_work() {
        let f = fixture();
        f.client.enable_account().await;
        assert_eq!(f.client.state(), ClientState::OkToRunCommands);
    }

    #[tokio::test]
    async fn init_reloads_status_persisted_by_a_previous_process() {
        let f = fixture();
        let account = f.client.account_id().clone();
        f.store
            .save_account_status(
                &account,
                AccountSyncStatus {
                    error: Some(MailError::HostNotFound("imap.example.com".into()).info()),
                    retry: RetryStatus {
                        interval_secs: 300,
                        count: 2,
                        reason: None,
                    },
                },
            )
            .await
            .unwrap();

        // Fresh client over the same store, as after a process restart.
        let client = AccountClient::new(
            account,
            AccountClientConfig::default(),
            f.store.clone(),
            f.backend.clone(),
            Arc::new(NullProgressReporter),
            f.accounts.clone(),
        );
        client.init().await.unwrap();

        let status = client.status().await.unwrap();
        assert_eq!(status.last_error.unwrap().code(), ErrorCode::HOST_NOT_FOUND);
        assert_eq!(status.retry.interval_secs, 300);
        assert_eq!(status.retry.count, 2);
    }

    #[tokio::test]
    async fn concurrent_check_queue_issues_a_single_account_load() {
        let f = fixture();
        let gate = Arc::new(Semaphore::new(0));
        f.accounts.hold_loads(gate.clone());

        let client = f.client.clone();
        let folder = f.folder.clone();
        let first = tokio::spawn(async move { client.sync_folder(&folder).await });
        while f.client.state() != ClientState::LoadingAccount {
            tokio::task::yield_now().await;
        }

        // A second driver arriving mid-load must not issue another fetch.
        f.client.check_queue().await;
        assert_eq!(f.accounts.calls(), vec!["get_account"]);

        gate.add_permits(1);
        first.await.unwrap();
        assert_eq!(f.client.state(), ClientState::OkToRunCommands);
        assert_eq!(f.accounts.calls(), vec!["get_account"]);
    }
}
