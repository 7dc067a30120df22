//! Execution log entries: the idempotency-enforcing ledger of rule activations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rule::TriggerKind;
use crate::error::{EngineError, Result};

/// Longest redacted summary kept in the log
pub const REDACTED_MAX_CHARS: usize = 500;

/// Status of a rule activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Reserved; actions may be running
    Started,

    /// Every action ran
    Ok,

    /// Conditions did not pass
    Skipped,

    /// At least one action (or the condition tree) failed
    Failed,

    /// Rule hit its per-minute ceiling
    RateLimited,

    /// At least one action is waiting for confirmation
    Pending,

    /// The triggering event came from this rule's own output
    LoopDetected,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Started => "started",
            ExecutionStatus::Ok => "ok",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::RateLimited => "rate_limited",
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::LoopDetected => "loop_detected",
        }
    }

    /// Guard outcomes are recorded but do not count as executions.
    pub fn counts_toward_rate(&self) -> bool {
        !matches!(self, ExecutionStatus::RateLimited | ExecutionStatus::LoopDetected)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(ExecutionStatus::Started),
            "ok" => Ok(ExecutionStatus::Ok),
            "skipped" => Ok(ExecutionStatus::Skipped),
            "failed" => Ok(ExecutionStatus::Failed),
            "rate_limited" => Ok(ExecutionStatus::RateLimited),
            "pending" => Ok(ExecutionStatus::Pending),
            "loop_detected" => Ok(ExecutionStatus::LoopDetected),
            other => Err(EngineError::Database(format!("unknown execution status: {}", other))),
        }
    }
}

/// One row of the execution log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub tenant_id: String,
    pub rule_id: i64,
    pub trigger_type: TriggerKind,

    /// `eventlog:<event id>` or `cron:<YYYYMMDDHHMM>`; unique per tenant and rule
    pub trigger_ref: String,

    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Error code(s) only, never raw messages
    pub error_redacted: Option<String>,

    /// Summary of outcomes and generated identifiers, never payload data
    pub output_redacted: Option<String>,
}

/// Result of trying to reserve a trigger_ref for a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// A `started` row was inserted; the caller owns this activation
    Started { log_id: i64 },

    /// A row already exists for this trigger_ref
    Duplicate,

    /// Recorded as `rate_limited`
    RateLimited,

    /// Recorded as `loop_detected`
    LoopDetected,
}

/// Clip a summary to the redacted length ceiling.
pub fn redact(text: &str) -> String {
    if text.chars().count() <= REDACTED_MAX_CHARS {
        return text.to_string();
    }
    let clipped: String = text.chars().take(REDACTED_MAX_CHARS - 3).collect();
    format!("{}...", clipped)
}
