//! rulekeeper - tenant-scoped automation rule engine
//!
//! Matches entries of an append-only event log (or cron ticks) against
//! user-defined rules, evaluates boolean conditions over a restricted
//! context, and dispatches allow-listed actions. Actions with real-world
//! effects wait for explicit human confirmation.
//!
//! # Architecture
//!
//! The engine is built around a per-tenant ledger:
//! - A cursor per tenant records how far the event log has been consumed
//! - The execution log holds one row per (rule, trigger instance), which is
//!   what makes side effects at-most-once
//! - Pending actions carry a single-use confirm token
//!
//! # Modules
//!
//! - `adapters`: Collaborator contracts and bundled implementations
//! - `core`: Evaluator, cron matcher, executor, processors, confirmation
//! - `domain`: Data structures (Rule, LogEvent, ExecutionLog, PendingAction)
//! - `store`: SQLite persistence
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Create a rule
//! rulekeeper --tenant acme rules create --file rule.json
//!
//! # Consume new events
//! rulekeeper --tenant acme process
//!
//! # Confirm a gated action
//! rulekeeper --tenant acme confirm 12 --token <token> --ack
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{ActionExecutor, ConfirmRequest, ConfirmResult, ProcessReport, RuleEngine, SimulationResult};
pub use domain::{ActionConfig, LogEvent, Rule, RuleDocument, TriggerContext};
pub use error::{EngineError, Result};
pub use store::{Database, EventSource, SqliteEventLog};
