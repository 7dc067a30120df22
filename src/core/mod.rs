//! Core engine logic.
//!
//! This module contains:
//! - Condition: the boolean evaluator over an allow-listed context
//! - Cron: 5-field schedule matching
//! - Template: placeholder rendering for action texts
//! - Safety: content limits, webhook domain and header policy
//! - Executor: action dispatch and the confirm gate
//! - Processor: the event-log and cron processors
//! - Confirm: two-phase commit for pending actions
//! - Simulate: side-effect-free dry runs

pub mod condition;
pub mod confirm;
pub mod cron;
pub mod executor;
pub mod processor;
pub mod retry;
pub mod safety;
pub mod simulate;
pub mod template;

// Re-export commonly used types
pub use condition::{evaluate, ConditionExpr};
pub use confirm::{ConfirmRequest, ConfirmResult};
pub use cron::CronSchedule;
pub use executor::{ActionExecutor, ActionOutcome, ActionPlan, ExecutorSettings};
pub use processor::{CronReport, EngineSettings, OutcomeTally, ProcessReport, RuleEngine, TenantPass};
pub use retry::RetryPolicy;
pub use safety::SafetyLimits;
pub use simulate::{SimulationResult, SimulationStatus};
