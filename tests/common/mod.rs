//! Shared fixtures for integration tests.
//!
//! Engines here run over an in-memory database with the local SQLite
//! collaborators and a recording webhook transport.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use rulekeeper::adapters::{
    CollaboratorError, CollaboratorResult, Collaborators, LocalCollaborators, TaskRequest, TaskService,
    WebhookRequest, WebhookTransport,
};
use rulekeeper::core::{ActionExecutor, EngineSettings, ExecutorSettings, RetryPolicy, RuleEngine, SafetyLimits};
use rulekeeper::domain::{LogEvent, Rule, RuleDocument};
use rulekeeper::error::{EngineError, Result};
use rulekeeper::store::{Database, EventSource, SqliteEventLog};

pub const ALLOWED_WEBHOOK_HOST: &str = "hooks.example.com";

/// Webhook transport that replays scripted statuses (200 once exhausted)
#[derive(Default)]
pub struct RecordingWebhook {
    statuses: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<WebhookRequest>>,
}

impl RecordingWebhook {
    pub fn respond_with(&self, statuses: &[u16]) {
        self.statuses.lock().unwrap().extend(statuses.iter().copied());
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookTransport for RecordingWebhook {
    async fn deliver(&self, request: &WebhookRequest) -> CollaboratorResult<u16> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.statuses.lock().unwrap().pop_front().unwrap_or(200))
    }
}

/// Task service that fails transiently a set number of times first
pub struct FlakyTasks {
    inner: Arc<LocalCollaborators>,
    failures_left: AtomicU32,
    pub calls: AtomicU32,
}

impl FlakyTasks {
    pub fn new(inner: Arc<LocalCollaborators>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskService for FlakyTasks {
    async fn create_task(&self, request: &TaskRequest) -> CollaboratorResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(CollaboratorError::Transient("task_service_busy".to_string()));
        }
        self.inner.create_task(request).await
    }
}

/// Event source that hands out the same batch regardless of the cursor
pub struct ReplayingEvents(pub Vec<LogEvent>);

#[async_trait]
impl EventSource for ReplayingEvents {
    async fn fetch_after(&self, tenant_id: &str, _after: i64, _limit: usize) -> Result<Vec<LogEvent>> {
        Ok(self.0.iter().filter(|e| e.tenant_id == tenant_id).cloned().collect())
    }

    async fn get(&self, tenant_id: &str, event_id: i64) -> Result<Option<LogEvent>> {
        Ok(self
            .0
            .iter()
            .find(|e| e.tenant_id == tenant_id && e.id == event_id)
            .cloned())
    }

    async fn latest_of_types(&self, _tenant_id: &str, _event_types: &[String]) -> Result<Option<LogEvent>> {
        Ok(None)
    }
}

/// Event source whose reads always fail transiently
pub struct UnavailableEvents;

#[async_trait]
impl EventSource for UnavailableEvents {
    async fn fetch_after(&self, _tenant_id: &str, _after: i64, _limit: usize) -> Result<Vec<LogEvent>> {
        Err(EngineError::Transient("event_log_unavailable".to_string()))
    }

    async fn get(&self, _tenant_id: &str, _event_id: i64) -> Result<Option<LogEvent>> {
        Err(EngineError::Transient("event_log_unavailable".to_string()))
    }

    async fn latest_of_types(&self, _tenant_id: &str, _event_types: &[String]) -> Result<Option<LogEvent>> {
        Err(EngineError::Transient("event_log_unavailable".to_string()))
    }
}

/// Everything a test needs to drive the engine
pub struct Harness {
    pub db: Database,
    pub log: SqliteEventLog,
    pub local: Arc<LocalCollaborators>,
    pub webhooks: Arc<RecordingWebhook>,
    pub engine: RuleEngine,
}

pub fn fast_settings() -> ExecutorSettings {
    ExecutorSettings {
        limits: SafetyLimits {
            webhook_allowed_domains: vec![ALLOWED_WEBHOOK_HOST.to_string()],
            ..SafetyLimits::default()
        },
        collaborator_retry: RetryPolicy::once_after(Duration::from_millis(1)),
        webhook_retry: RetryPolicy::once_after(Duration::from_millis(1)),
    }
}

fn engine_settings() -> EngineSettings {
    EngineSettings {
        storage_retry_delay: Duration::from_millis(1),
        ..EngineSettings::default()
    }
}

/// Harness over a fresh in-memory database
pub fn harness() -> Harness {
    harness_on(Database::open_in_memory().unwrap())
}

/// Harness over an existing database
pub fn harness_on(db: Database) -> Harness {
    let local = Arc::new(LocalCollaborators::new(db.clone()));
    let webhooks = Arc::new(RecordingWebhook::default());
    let collaborators = Collaborators::local(local.clone(), webhooks.clone());
    let executor = ActionExecutor::new(db.clone(), collaborators, fast_settings());
    let log = SqliteEventLog::new(db.clone());
    let engine = RuleEngine::new(db.clone(), Arc::new(log.clone()), executor, engine_settings());
    Harness {
        db,
        log,
        local,
        webhooks,
        engine,
    }
}

/// Engine with custom collaborators and event source over `db`
pub fn engine_with(db: &Database, collaborators: Collaborators, events: Arc<dyn EventSource>) -> RuleEngine {
    let executor = ActionExecutor::new(db.clone(), collaborators, fast_settings());
    RuleEngine::new(db.clone(), events, executor, engine_settings())
}

/// Create a rule from an import document
pub fn create_rule(db: &Database, tenant_id: &str, document: Value) -> Rule {
    let draft = RuleDocument::from_json(&document.to_string())
        .unwrap()
        .into_draft()
        .unwrap();
    db.create_rule(tenant_id, &draft).unwrap()
}

/// Append an event to the bundled log
pub fn append(log: &SqliteEventLog, tenant_id: &str, event_type: &str, payload: Value) -> LogEvent {
    log.append(&LogEvent::new(tenant_id, event_type, "email", Some("m-1".to_string()), payload))
        .unwrap()
}
