//! Shared collaborator doubles for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use syncmail::account::{AccountRecord, AccountService, RetryStatus};
use syncmail::activity::backend::{ActivityBackend, ActivityId, StartOutcome};
use syncmail::activity::ActivitySpec;
use syncmail::client::{AccountClient, AccountClientConfig};
use syncmail::error::{MailError, Result};
use syncmail::progress::{ProgressReporter, SyncStateRecord};
use syncmail::store::MemoryStore;
use syncmail::types::{AccountId, FolderId};

static INIT_TRACING: Once = Once::new();

/// Route engine logs through the env filter (`RUST_LOG`) during tests.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Activity-scheduler double that records every call.
#[derive(Default)]
pub struct RecordingScheduler {
    seq: AtomicU64,
    pub calls: Mutex<Vec<String>>,
    pub created: Mutex<Vec<ActivitySpec>>,
    pub cancelled_names: Mutex<Vec<String>>,
}

impl RecordingScheduler {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ActivityBackend for RecordingScheduler {
    async fn create(&self, spec: &ActivitySpec) -> Result<StartOutcome> {
        self.record(format!("create:{}", spec.name));
        self.created.lock().unwrap().push(spec.clone());
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
        self.cancelled_names.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, id: &ActivityId) -> Result<()> {
        self.record(format!("unsubscribe:{id}"));
        Ok(())
    }
}

/// Account-service double with injectable load failures.
#[derive(Default)]
pub struct TestAccountService {
    pub fail_loads: Mutex<u32>,
    pub calls: Mutex<Vec<String>>,
}

impl TestAccountService {
    pub fn fail_next_loads(&self, n: u32) {
        *self.fail_loads.lock().unwrap() = n;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccountService for TestAccountService {
    async fn get_account(&self, id: &AccountId) -> Result<AccountRecord> {
        self.calls.lock().unwrap().push("get_account".into());
        {
            let mut fails = self.fail_loads.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                return Err(MailError::ConnectionFailed("bus unavailable".into()));
            }
        }
        Ok(AccountRecord {
            id: id.clone(),
            display_name: "Integration Account".into(),
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

/// Progress-reporter double recording indicator updates in order.
#[derive(Default)]
pub struct RecordingProgress {
    pub records: Mutex<Vec<SyncStateRecord>>,
}

impl RecordingProgress {
    pub fn records(&self) -> Vec<SyncStateRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressReporter for RecordingProgress {
    async fn update(&self, record: SyncStateRecord) -> Result<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

pub struct TestRig {
    pub account_id: AccountId,
    pub store: Arc<MemoryStore>,
    pub scheduler: Arc<RecordingScheduler>,
    pub accounts: Arc<TestAccountService>,
    pub progress: Arc<RecordingProgress>,
    pub client: Arc<AccountClient>,
}

impl TestRig {
    /// A client over an in-memory store with the given folders pre-created.
    pub fn new(folders: &[&str]) -> Self {
        init_tracing();
        let account_id = AccountId::new("acct-1");
        let store = Arc::new(MemoryStore::new());
        for folder in folders {
            store.add_folder(&account_id, &FolderId::new(*folder), folder);
        }
        let scheduler = Arc::new(RecordingScheduler::default());
        let accounts = Arc::new(TestAccountService::default());
        let progress = Arc::new(RecordingProgress::default());
        let client = AccountClient::new(
            account_id.clone(),
            AccountClientConfig::default(),
            store.clone(),
            scheduler.clone(),
            progress.clone(),
            accounts.clone(),
        );
        Self { account_id, store, scheduler, accounts, progress, client }
    }
}
