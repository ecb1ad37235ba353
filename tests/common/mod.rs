//! Shared fixtures: a scripted executor that tracks checked-out connections,
//! and a fully wired service over the in-memory store.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use sqlgate::config::Config;
use sqlgate::engine::{
    DataSourceExecutor, ExecError, ManualClock, OpenTransaction, QueryResult, QueryService,
};
use sqlgate::middleware::auth::issue_token;
use sqlgate::middleware::rbac::{Identity, Role};
use sqlgate::notification::RecordingSink;
use sqlgate::store::memory::MemoryStore;
use sqlgate::{build_service, AppState};

pub const JWT_SECRET: &str = "test-secret";

/// Rows a scripted statement reports.
pub const SCRIPTED_ROWS: u64 = 3;

#[derive(Default)]
struct Script {
    /// Statements containing the key fail with the error.
    failures: Vec<(String, ExecError)>,
    commit_error: Option<ExecError>,
    commit_delay: Option<Duration>,
    begin_delay: Option<Duration>,
}

#[derive(Default)]
pub struct FakeExecutor {
    known: Mutex<HashSet<Uuid>>,
    max_connections: usize,
    checked_out: Arc<AtomicUsize>,
    script: Arc<Mutex<Script>>,
    pub reads: Mutex<Vec<String>>,
    committed: Arc<Mutex<Vec<String>>>,
    pub rolled_back: Arc<AtomicUsize>,
    pub began: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    pub fn register(&self, data_source_id: Uuid) {
        self.known.lock().unwrap().insert(data_source_id);
    }

    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    pub fn fail_on(&self, fragment: &str, error: ExecError) {
        self.script
            .lock()
            .unwrap()
            .failures
            .push((fragment.to_string(), error));
    }

    pub fn fail_commit(&self, error: ExecError) {
        self.script.lock().unwrap().commit_error = Some(error);
    }

    pub fn delay_commit(&self, by: Duration) {
        self.script.lock().unwrap().commit_delay = Some(by);
    }

    pub fn delay_begin(&self, by: Duration) {
        self.script.lock().unwrap().begin_delay = Some(by);
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().unwrap().clone()
    }

    fn check(&self, data_source_id: Uuid) -> Result<(), ExecError> {
        if self.known.lock().unwrap().contains(&data_source_id) {
            Ok(())
        } else {
            Err(ExecError::UnknownDataSource(data_source_id))
        }
    }
}

fn scripted_result(script: &Script, sql: &str, max_rows: usize) -> Result<QueryResult, ExecError> {
    if let Some((_, err)) = script.failures.iter().find(|(f, _)| sql.contains(f.as_str())) {
        return Err(err.clone());
    }
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("EXPLAIN") || upper.starts_with("WITH") {
        let rows: Vec<Vec<serde_json::Value>> = (1..=SCRIPTED_ROWS)
            .map(|i| vec![json!(i), json!(format!("row-{i}"))])
            .collect();
        let kept = rows.into_iter().take(max_rows).collect::<Vec<_>>();
        Ok(QueryResult {
            columns: vec!["id".into(), "name".into()],
            truncated: (kept.len() as u64) < SCRIPTED_ROWS,
            rows: kept,
            rows_returned: SCRIPTED_ROWS,
            rows_affected: 0,
        })
    } else {
        Ok(QueryResult {
            rows_affected: SCRIPTED_ROWS,
            ..Default::default()
        })
    }
}

#[async_trait]
impl DataSourceExecutor for FakeExecutor {
    async fn ensure_data_source(&self, data_source_id: Uuid) -> Result<(), ExecError> {
        self.check(data_source_id)
    }

    async fn query_read_only(
        &self,
        data_source_id: Uuid,
        sql: &str,
        max_rows: usize,
    ) -> Result<QueryResult, ExecError> {
        self.check(data_source_id)?;
        self.reads.lock().unwrap().push(sql.to_string());
        let script = self.script.lock().unwrap();
        scripted_result(&script, sql, max_rows)
    }

    async fn begin(&self, data_source_id: Uuid) -> Result<Box<dyn OpenTransaction>, ExecError> {
        self.check(data_source_id)?;
        let delay = self.script.lock().unwrap().begin_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let taken = self
            .checked_out
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_connections).then_some(n + 1)
            });
        if taken.is_err() {
            return Err(ExecError::PoolExhausted);
        }
        self.began.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTx {
            checked_out: self.checked_out.clone(),
            script: self.script.clone(),
            committed: self.committed.clone(),
            rolled_back: self.rolled_back.clone(),
            executed: Vec::new(),
            released: AtomicBool::new(false),
        }))
    }
}

struct FakeTx {
    checked_out: Arc<AtomicUsize>,
    script: Arc<Mutex<Script>>,
    committed: Arc<Mutex<Vec<String>>>,
    rolled_back: Arc<AtomicUsize>,
    executed: Vec<String>,
    released: AtomicBool,
}

impl FakeTx {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.checked_out.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeTx {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl OpenTransaction for FakeTx {
    async fn execute(&mut self, sql: &str, max_rows: usize) -> Result<QueryResult, ExecError> {
        let result = {
            let script = self.script.lock().unwrap();
            scripted_result(&script, sql, max_rows)
        };
        if result.is_ok() {
            self.executed.push(sql.to_string());
        }
        result
    }

    async fn commit(self: Box<Self>) -> Result<(), ExecError> {
        let (delay, error) = {
            let script = self.script.lock().unwrap();
            (script.commit_delay, script.commit_error.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.release();
        match error {
            Some(e) => Err(e),
            None => {
                self.committed
                    .lock()
                    .unwrap()
                    .extend(self.executed.iter().cloned());
                Ok(())
            }
        }
    }

    async fn rollback(self: Box<Self>) -> Result<(), ExecError> {
        self.release();
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub service: QueryService,
    pub store: Arc<MemoryStore>,
    pub executor: Arc<FakeExecutor>,
    pub notifier: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
    pub config: Config,
    pub data_source_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config {
            jwt_secret: JWT_SECRET.into(),
            ..Config::default()
        })
    }

    pub fn with_config(config: Config) -> Self {
        let executor = Arc::new(FakeExecutor::new(4));
        let data_source_id = Uuid::new_v4();
        executor.register(data_source_id);

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        ));

        let service = build_service(
            &config,
            executor.clone(),
            store.clone(),
            store.clone(),
            notifier.clone(),
            clock.clone(),
        );

        Self {
            service,
            store,
            executor,
            notifier,
            clock,
            config,
            data_source_id,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            service: self.service.clone(),
            config: self.config.clone(),
        })
    }

    /// Submit a mutation as `editor` and return the pending request id.
    pub async fn submit_pending(&self, sql: &str) -> Uuid {
        match self
            .service
            .submit(&editor("editor"), sql, self.data_source_id)
            .await
            .unwrap()
        {
            sqlgate::engine::Submission::Pending { approval } => approval.id,
            other => panic!("expected pending submission, got {:?}", other),
        }
    }

    /// Submit and approve with a single reviewer.
    pub async fn approved(&self, sql: &str) -> Uuid {
        let id = self.submit_pending(sql).await;
        self.service
            .review(
                &reviewer("reviewer"),
                id,
                sqlgate::models::ReviewDecision::Approved,
                None,
            )
            .await
            .unwrap();
        id
    }
}

pub fn editor(user: &str) -> Identity {
    Identity::new(user, Role::Editor, vec!["*".into()])
}

pub fn reviewer(user: &str) -> Identity {
    Identity::new(user, Role::Reviewer, vec!["*".into()])
}

pub fn viewer(user: &str) -> Identity {
    Identity::new(user, Role::Viewer, vec!["*".into()])
}

pub fn bearer(identity: &Identity) -> String {
    let token = issue_token(JWT_SECRET, identity, chrono::Duration::minutes(10)).unwrap();
    format!("Bearer {}", token)
}
