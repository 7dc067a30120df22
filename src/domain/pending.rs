//! Action proposals waiting for a human to confirm them.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::action::{ActionConfig, ActionKind};
use super::context::ContextSnapshot;

/// A persisted pending action
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingAction {
    pub id: i64,
    pub tenant_id: String,
    pub rule_id: i64,
    pub action_type: ActionKind,

    /// Config as it was when the proposal was made
    pub action_config: ActionConfig,

    /// Allow-listed context fields only
    pub context_snapshot: ContextSnapshot,

    /// Opaque single-use token
    pub confirm_token: String,

    pub created_at: DateTime<Utc>,

    /// Set exactly once, when the proposal is consumed
    pub confirmed_at: Option<DateTime<Utc>>,

    /// Code of the last failed confirm attempt
    pub last_error: Option<String>,

    /// Identifier returned by the collaborator after confirmation
    pub result_redacted: Option<String>,
}

impl PendingAction {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

/// Values needed to insert a pending action
#[derive(Debug, Clone)]
pub struct NewPendingAction {
    pub tenant_id: String,
    pub rule_id: i64,
    pub action_config: ActionConfig,
    pub context_snapshot: ContextSnapshot,
    pub confirm_token: String,
}

/// Generate an unguessable confirm token (256 bits, hex)
pub fn generate_confirm_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Compare tokens without short-circuiting on the first differing byte.
pub fn tokens_match(expected: &str, supplied: &str) -> bool {
    let (a, b) = (expected.as_bytes(), supplied.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
