//! Dry-run a rule against an event: no log rows, no pending actions, no
//! effects.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::condition::evaluate_rule;
use super::cron::{minute_ref, truncate_to_minute, CronSchedule};
use super::executor::ActionPlan;
use super::processor::{not_found, RuleEngine};
use crate::domain::rule::validate_tenant;
use crate::domain::{ActionKind, ConditionConfig, Rule, TriggerContext, TriggerKind, CONTEXT_FIELDS};
use crate::error::Result;

/// Predicted status of a simulated activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStatus {
    /// No event to simulate against
    NoEvent,

    /// The trigger would not fire
    NotMatched,

    /// Conditions would not pass
    Skipped,

    /// Every action would run
    Ok,

    /// At least one action would wait for confirmation
    Pending,

    /// The condition tree or an action would fail
    Failed,
}

/// Predicted outcome of one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionPreview {
    pub action_type: ActionKind,

    #[serde(flatten)]
    pub plan: ActionPlan,
}

/// Simulation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationResult {
    pub matched: bool,
    pub condition_passed: bool,
    pub status: SimulationStatus,
    pub result: Vec<ActionPreview>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SimulationResult {
    fn unmatched(status: SimulationStatus, trigger_ref: Option<String>) -> Self {
        Self {
            matched: false,
            condition_passed: false,
            status,
            result: Vec::new(),
            trigger_ref,
            error: None,
        }
    }
}

impl RuleEngine {
    /// Simulate a rule. Without `event_id` the most recent tenant event of a
    /// type the rule listens to is used; cron-only rules are simulated at `now`.
    pub async fn simulate(
        &self,
        tenant_id: &str,
        rule_id: i64,
        event_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<SimulationResult> {
        validate_tenant(tenant_id)?;
        let rule = self.db.get_rule(tenant_id, rule_id)?;

        let (ctx, matched) = if rule.has_trigger(TriggerKind::Eventlog) || event_id.is_some() {
            let event = match event_id {
                Some(id) => Some(
                    self.events
                        .get(tenant_id, id)
                        .await?
                        .ok_or_else(|| not_found("event", id))?,
                ),
                None => self.events.latest_of_types(tenant_id, &rule.event_types()).await?,
            };
            match event {
                Some(event) => {
                    let matched = rule.listens_to(&event.event_type);
                    (TriggerContext::from_event(&event), matched)
                }
                None if rule.has_trigger(TriggerKind::Cron) => cron_context(&rule, now),
                None => return Ok(SimulationResult::unmatched(SimulationStatus::NoEvent, None)),
            }
        } else {
            cron_context(&rule, now)
        };

        if !matched {
            return Ok(SimulationResult::unmatched(
                SimulationStatus::NotMatched,
                Some(ctx.trigger_ref),
            ));
        }

        let conditions: Vec<&Value> = rule
            .conditions
            .iter()
            .map(|c| match &c.config {
                ConditionConfig::Expression(tree) => tree,
            })
            .collect();
        let passed = match evaluate_rule(&conditions, &ctx, CONTEXT_FIELDS) {
            Ok(passed) => passed,
            Err(_) => {
                return Ok(SimulationResult {
                    matched: true,
                    condition_passed: false,
                    status: SimulationStatus::Failed,
                    result: Vec::new(),
                    trigger_ref: Some(ctx.trigger_ref),
                    error: Some("condition_invalid".to_string()),
                });
            }
        };
        if !passed {
            return Ok(SimulationResult {
                matched: true,
                condition_passed: false,
                status: SimulationStatus::Skipped,
                result: Vec::new(),
                trigger_ref: Some(ctx.trigger_ref),
                error: None,
            });
        }

        let mut result = Vec::with_capacity(rule.actions.len());
        for action in &rule.actions {
            let plan = self.executor.plan(tenant_id, rule.id, &action.config, &ctx).await;
            result.push(ActionPreview {
                action_type: action.config.kind(),
                plan,
            });
        }

        let status = if result.iter().any(|p| matches!(p.plan, ActionPlan::WouldFail { .. })) {
            SimulationStatus::Failed
        } else if result.iter().any(|p| p.plan == ActionPlan::WouldPend) {
            SimulationStatus::Pending
        } else {
            SimulationStatus::Ok
        };

        Ok(SimulationResult {
            matched: true,
            condition_passed: true,
            status,
            result,
            trigger_ref: Some(ctx.trigger_ref),
            error: None,
        })
    }
}

/// Context for a cron-only rule at the minute containing `now`.
fn cron_context(rule: &Rule, now: DateTime<Utc>) -> (TriggerContext, bool) {
    let minute = truncate_to_minute(&now);
    let matched = rule
        .cron_expressions()
        .into_iter()
        .filter_map(|expression| CronSchedule::parse(expression).ok())
        .any(|schedule| schedule.matches(&minute));
    let ctx = TriggerContext::for_cron(&rule.tenant_id, minute, minute_ref(&minute));
    (ctx, matched)
}
