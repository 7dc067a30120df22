//! Domain types for the rule engine.
//!
//! This module contains the core data structures:
//! - Rules: triggers, conditions and actions with typed configs
//! - Events: entries of the shared event log the engine consumes
//! - Context: the allow-listed projection conditions and templates see
//! - Execution: the idempotency ledger
//! - Pending: action proposals awaiting confirmation

pub mod action;
pub mod context;
pub mod events;
pub mod execution;
pub mod pending;
pub mod rule;

// Re-export commonly used types
pub use action::{
    ActionConfig, ActionKind, EmailActionConfig, PostfachDraftConfig, TaskActionConfig, WebhookActionConfig,
    WebhookMethod,
};
pub use context::{
    ContextLookup, ContextSnapshot, TriggerContext, CONTEXT_FIELDS, SNAPSHOT_FIELDS, TEMPLATE_FIELDS,
};
pub use events::LogEvent;
pub use execution::{ExecutionLog, ExecutionStatus, Reservation};
pub use pending::{NewPendingAction, PendingAction};
pub use rule::{
    Action, Condition, ConditionConfig, Rule, RuleDocument, RuleDraft, RulePatch, RulePatchDocument, Trigger,
    TriggerConfig, TriggerKind,
};
