//! The rule engine: event-log and cron processors over one activation
//! pipeline.
//!
//! Every activation goes through the same steps: reserve the trigger_ref
//! (duplicate, loop and rate guards), evaluate conditions, dispatch actions,
//! finalize the log row. Batches for one tenant are serialized by an async
//! lock; different tenants proceed independently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};

use super::condition::evaluate_rule;
use super::cron::{minute_ref, truncate_to_minute, CronSchedule};
use super::executor::{ActionExecutor, ActionOutcome};
use crate::domain::rule::validate_tenant;
use crate::domain::{
    ConditionConfig, ExecutionStatus, Reservation, Rule, TriggerContext, TriggerKind, CONTEXT_FIELDS,
};
use crate::error::{EngineError, Result};
use crate::store::{Database, EventSource, ReserveRequest, EVENTLOG_SOURCE};

/// Default events per batch
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Hard ceiling on events per batch
pub const MAX_BATCH_SIZE: usize = 1000;

/// Reason recorded when a rule's condition tree cannot be evaluated
const CONDITION_INVALID: &str = "condition_invalid";

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Events fetched per batch (clamped to 1..=1000)
    pub batch_size: usize,

    /// Pause before the single retry of a transient storage failure
    pub storage_retry_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            storage_retry_delay: Duration::from_millis(200),
        }
    }
}

impl EngineSettings {
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

/// Activation outcomes of one run, by final status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeTally {
    /// (trigger, rule) pairs whose trigger matched
    pub matched: usize,
    pub executed: usize,
    pub pending: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub loop_detected: usize,
    pub duplicates: usize,
}

impl OutcomeTally {
    fn record(&mut self, status: ExecutionStatus) {
        match status {
            ExecutionStatus::Ok => self.executed += 1,
            ExecutionStatus::Pending => self.pending += 1,
            ExecutionStatus::Skipped => self.skipped += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::RateLimited => self.rate_limited += 1,
            ExecutionStatus::LoopDetected => self.loop_detected += 1,
            ExecutionStatus::Started => {}
        }
    }
}

/// Result of one event-log batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub ok: bool,

    /// Events fully processed (cursor moved past them)
    pub processed: usize,

    #[serde(flatten)]
    pub tally: OutcomeTally,

    /// Cursor after the batch
    pub cursor: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one cron tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CronReport {
    pub ok: bool,
    pub minute_ref: String,

    #[serde(flatten)]
    pub tally: OutcomeTally,

    /// Rules switched off because a stored expression no longer parses
    pub disabled: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reports of one scheduler pass for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantPass {
    pub tenant_id: String,
    pub eventlog: ProcessReport,
    pub cron: CronReport,
}

/// How an activation ended, as seen by the batch loop
enum Activation {
    Finished(ExecutionStatus),
    Duplicate,
    RuleDisabled(ExecutionStatus),
}

/// Tenant-scoped automation rule engine
pub struct RuleEngine {
    pub(super) db: Database,
    pub(super) events: Arc<dyn EventSource>,
    pub(super) executor: ActionExecutor,
    pub(super) settings: EngineSettings,
    tenant_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RuleEngine {
    pub fn new(db: Database, events: Arc<dyn EventSource>, executor: ActionExecutor, settings: EngineSettings) -> Self {
        Self {
            db,
            events,
            executor,
            settings,
            tenant_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.tenant_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Consume new events of a tenant from its cursor onwards.
    ///
    /// A storage failure that survives one retry stops the batch; the report
    /// then carries `ok: false` and the cursor of the last completed event.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn process_eventlog(&self, tenant_id: &str) -> Result<ProcessReport> {
        validate_tenant(tenant_id)?;
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let mut report = ProcessReport::default();
        match self.run_eventlog_batch(tenant_id, &mut report).await {
            Ok(()) => report.ok = true,
            Err(e) => {
                error!(error = %e, processed = report.processed, cursor = report.cursor, "Event batch aborted");
                report.error = Some(e.code());
            }
        }

        info!(
            processed = report.processed,
            matched = report.tally.matched,
            executed = report.tally.executed,
            pending = report.tally.pending,
            failed = report.tally.failed,
            cursor = report.cursor,
            "Event batch finished"
        );
        Ok(report)
    }

    async fn run_eventlog_batch(&self, tenant_id: &str, report: &mut ProcessReport) -> Result<()> {
        let cursor = self.storage_retry("read_cursor", || self.db.get_cursor(tenant_id, EVENTLOG_SOURCE)).await?;
        report.cursor = cursor;

        let batch_size = self.settings.effective_batch_size();
        let events = match self.events.fetch_after(tenant_id, cursor, batch_size).await {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Event fetch failed, retrying");
                tokio::time::sleep(self.settings.storage_retry_delay).await;
                self.events.fetch_after(tenant_id, cursor, batch_size).await?
            }
            result => result?,
        };
        if events.is_empty() {
            return Ok(());
        }

        let rules = self.storage_retry("load_rules", || self.db.list_enabled_rules(tenant_id)).await?;
        let mut disabled: HashSet<i64> = HashSet::new();

        for event in &events {
            let ctx = TriggerContext::from_event(event);
            let origin = event.origin_rule_id();

            for rule in &rules {
                if disabled.contains(&rule.id) || !rule.listens_to(&event.event_type) {
                    continue;
                }
                report.tally.matched += 1;
                let self_triggered = origin == Some(rule.id);
                match self.activate(rule, &ctx, self_triggered).await? {
                    Activation::Finished(status) => report.tally.record(status),
                    Activation::Duplicate => report.tally.duplicates += 1,
                    Activation::RuleDisabled(status) => {
                        report.tally.record(status);
                        disabled.insert(rule.id);
                    }
                }
            }

            report.cursor = self
                .storage_retry("advance_cursor", || self.db.advance_cursor(tenant_id, EVENTLOG_SOURCE, event.id))
                .await?;
            report.processed += 1;
        }
        Ok(())
    }

    /// Evaluate cron triggers of a tenant for the minute containing `at`.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn run_cron_tick(&self, tenant_id: &str, at: DateTime<Utc>) -> Result<CronReport> {
        validate_tenant(tenant_id)?;
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let minute = truncate_to_minute(&at);
        let mut report = CronReport {
            minute_ref: minute_ref(&minute),
            ..Default::default()
        };

        match self.run_cron_rules(tenant_id, minute, &mut report).await {
            Ok(()) => report.ok = true,
            Err(e) => {
                error!(error = %e, minute_ref = %report.minute_ref, "Cron tick aborted");
                report.error = Some(e.code());
            }
        }

        info!(
            minute_ref = %report.minute_ref,
            matched = report.tally.matched,
            executed = report.tally.executed,
            pending = report.tally.pending,
            disabled = report.disabled,
            "Cron tick finished"
        );
        Ok(report)
    }

    async fn run_cron_rules(&self, tenant_id: &str, minute: DateTime<Utc>, report: &mut CronReport) -> Result<()> {
        let rules = self.storage_retry("load_rules", || self.db.list_enabled_rules(tenant_id)).await?;

        for rule in rules.iter().filter(|r| r.has_trigger(TriggerKind::Cron)) {
            let mut due = false;
            let mut invalid = None;
            for expression in rule.cron_expressions() {
                match CronSchedule::parse(expression) {
                    Ok(schedule) => due |= schedule.matches(&minute),
                    Err(e) => invalid = Some(e.code()),
                }
            }

            if let Some(reason) = invalid {
                self.storage_retry("auto_disable", || self.db.auto_disable_rule(tenant_id, rule.id, &reason))
                    .await?;
                report.disabled += 1;
                continue;
            }
            if !due {
                continue;
            }

            report.tally.matched += 1;
            let ctx = TriggerContext::for_cron(tenant_id, minute, report.minute_ref.clone());
            match self.activate(rule, &ctx, false).await? {
                Activation::Finished(status) | Activation::RuleDisabled(status) => report.tally.record(status),
                Activation::Duplicate => report.tally.duplicates += 1,
            }
        }
        Ok(())
    }

    /// One scheduler pass: event batch and cron tick for every tenant that
    /// owns enabled rules.
    pub async fn run_scheduled_pass(&self, now: DateTime<Utc>) -> Result<Vec<TenantPass>> {
        let tenants = self.storage_retry("list_tenants", || self.db.rule_tenants()).await?;
        let mut passes = Vec::with_capacity(tenants.len());
        for tenant_id in tenants {
            let eventlog = self.process_eventlog(&tenant_id).await?;
            let cron = self.run_cron_tick(&tenant_id, now).await?;
            passes.push(TenantPass {
                tenant_id,
                eventlog,
                cron,
            });
        }
        Ok(passes)
    }

    /// Reserve, evaluate, dispatch and finalize one rule activation.
    async fn activate(&self, rule: &Rule, ctx: &TriggerContext, self_triggered: bool) -> Result<Activation> {
        let tenant_id = rule.tenant_id.as_str();
        let request = ReserveRequest {
            tenant_id,
            rule_id: rule.id,
            trigger_type: ctx.source,
            trigger_ref: &ctx.trigger_ref,
            max_executions_per_minute: rule.max_executions_per_minute,
            self_triggered,
            now: Utc::now(),
        };

        let log_id = match self.storage_retry("reserve", || self.db.reserve_execution(&request)).await? {
            Reservation::Started { log_id } => log_id,
            Reservation::Duplicate => {
                debug!(rule_id = rule.id, trigger_ref = %ctx.trigger_ref, "Already handled");
                return Ok(Activation::Duplicate);
            }
            Reservation::RateLimited => {
                debug!(rule_id = rule.id, trigger_ref = %ctx.trigger_ref, "Rate limited");
                return Ok(Activation::Finished(ExecutionStatus::RateLimited));
            }
            Reservation::LoopDetected => {
                debug!(rule_id = rule.id, trigger_ref = %ctx.trigger_ref, "Loop detected");
                return Ok(Activation::Finished(ExecutionStatus::LoopDetected));
            }
        };

        let conditions: Vec<&Value> = rule
            .conditions
            .iter()
            .map(|c| match &c.config {
                ConditionConfig::Expression(tree) => tree,
            })
            .collect();

        match evaluate_rule(&conditions, ctx, CONTEXT_FIELDS) {
            Err(e) => {
                warn!(rule_id = rule.id, error = %e, "Condition tree invalid");
                self.finish(tenant_id, log_id, ExecutionStatus::Failed, Some(CONDITION_INVALID), None)
                    .await?;
                self.storage_retry("auto_disable", || {
                    self.db.auto_disable_rule(tenant_id, rule.id, CONDITION_INVALID)
                })
                .await?;
                return Ok(Activation::RuleDisabled(ExecutionStatus::Failed));
            }
            Ok(false) => {
                debug!(rule_id = rule.id, trigger_ref = %ctx.trigger_ref, "Conditions not met");
                self.finish(tenant_id, log_id, ExecutionStatus::Skipped, Some("condition_false"), None)
                    .await?;
                return Ok(Activation::Finished(ExecutionStatus::Skipped));
            }
            Ok(true) => {}
        }

        let mut summaries = Vec::with_capacity(rule.actions.len());
        let mut errors = Vec::new();
        let mut any_pending = false;
        for action in &rule.actions {
            let outcome = self
                .executor
                .dispatch(tenant_id, rule.id, &action.config, ctx)
                .await?;
            summaries.push(outcome.summary(action.config.kind()));
            match outcome {
                ActionOutcome::Failed { error } => errors.push(error),
                ActionOutcome::Pending { .. } => any_pending = true,
                ActionOutcome::Executed { .. } => {}
            }
        }

        let status = if !errors.is_empty() {
            ExecutionStatus::Failed
        } else if any_pending {
            ExecutionStatus::Pending
        } else {
            ExecutionStatus::Ok
        };
        let error = (!errors.is_empty()).then(|| errors.join(","));
        let output = summaries.join(";");
        self.finish(tenant_id, log_id, status, error.as_deref(), Some(&output)).await?;

        debug!(rule_id = rule.id, trigger_ref = %ctx.trigger_ref, status = %status, "Activation finished");
        Ok(Activation::Finished(status))
    }

    async fn finish(
        &self,
        tenant_id: &str,
        log_id: i64,
        status: ExecutionStatus,
        error: Option<&str>,
        output: Option<&str>,
    ) -> Result<()> {
        self.storage_retry("finish", || self.db.finish_execution(tenant_id, log_id, status, error, output))
            .await
    }

    /// Run a storage operation, retrying a transient failure once.
    pub(super) async fn storage_retry<T>(&self, operation: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        match op() {
            Err(e) if e.is_transient() => {
                warn!(
                    operation,
                    delay_ms = self.settings.storage_retry_delay.as_millis() as u64,
                    error = %e,
                    "Storage operation failed, retrying"
                );
                tokio::time::sleep(self.settings.storage_retry_delay).await;
                op()
            }
            result => result,
        }
    }
}

/// Reject an id that is not known to the tenant.
pub(super) fn not_found(what: &str, id: i64) -> EngineError {
    EngineError::NotFound(format!("{} {}", what, id))
}
