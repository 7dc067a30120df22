//! Entries of the shared, append-only event log.
//!
//! The log is owned by other parts of the system (mail ingestion, CRM, task
//! service). The engine only reads it, strictly in ascending id order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload key collaborators set on events they emit on behalf of a rule.
pub const ORIGIN_RULE_KEY: &str = "automation_rule_id";

/// A single entry in the tenant's event log.
///
/// The payload is opaque to the engine. Conditions and templates never see it
/// directly; see [`crate::domain::TriggerContext`] for the projection they get.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Strictly increasing position in the log
    pub id: i64,

    /// Owning tenant
    pub tenant_id: String,

    /// When the event was recorded
    pub timestamp: DateTime<Utc>,

    /// Dotted event name, e.g. `email.received`
    pub event_type: String,

    /// Kind of entity the event is about (`email`, `contact`, ...)
    pub entity_type: String,

    /// Identifier of that entity, if any
    pub entity_id: Option<String>,

    /// Raw payload (may contain PII; never exposed)
    pub payload: Value,
}

impl LogEvent {
    /// Create a new event with the current timestamp (id assigned on append)
    pub fn new(
        tenant_id: impl Into<String>,
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: 0,
            tenant_id: tenant_id.into(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            entity_type: entity_type.into(),
            entity_id,
            payload,
        }
    }

    /// Rule whose action produced this event, when the emitter tagged it.
    pub fn origin_rule_id(&self) -> Option<i64> {
        match self.payload.get(ORIGIN_RULE_KEY)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Sender domain derived from the payload's sender address.
    ///
    /// Only the lowercased domain leaves this function; the address itself
    /// does not.
    pub fn sender_domain(&self) -> Option<String> {
        let raw = ["from", "from_email", "sender"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(Value::as_str))?;

        let address = match (raw.rfind('<'), raw.rfind('>')) {
            (Some(start), Some(end)) if start < end => &raw[start + 1..end],
            _ => raw,
        };

        let (_, domain) = address.trim().rsplit_once('@')?;
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() || domain.contains(char::is_whitespace) {
            return None;
        }
        Some(domain)
    }

    /// Whether the payload announces attachments.
    pub fn has_attachments(&self) -> Option<bool> {
        if let Some(list) = self.payload.get("attachments").and_then(Value::as_array) {
            return Some(!list.is_empty());
        }
        self.payload
            .get("attachment_count")
            .and_then(Value::as_u64)
            .map(|count| count > 0)
    }
}
