//! The allow-listed context that conditions and templates are evaluated over.
//!
//! Nothing from an event payload reaches a condition, a template, or durable
//! pending-action storage except through the enumerated fields below.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::LogEvent;
use super::rule::TriggerKind;

/// Every field a trigger context can expose.
pub const CONTEXT_FIELDS: &[&str] = &[
    "event_id",
    "event_type",
    "entity_type",
    "entity_id",
    "tenant_id",
    "timestamp",
    "trigger_ref",
    "source",
    "from_domain",
    "has_attachments",
    "minute_ref",
];

/// Placeholders a mail/task/webhook template may reference.
pub const TEMPLATE_FIELDS: &[&str] = &[
    "event_id",
    "event_type",
    "entity_type",
    "entity_id",
    "timestamp",
    "trigger_ref",
    "source",
    "from_domain",
    "minute_ref",
];

/// Fields copied into a pending action's durable snapshot.
///
/// Must cover [`TEMPLATE_FIELDS`] so a confirmed action renders the same way
/// the proposal did.
pub const SNAPSHOT_FIELDS: &[&str] = TEMPLATE_FIELDS;

/// Read access to a context by field name.
pub trait ContextLookup {
    /// Value of `field`, or `None` when the field is absent or unknown.
    fn lookup(&self, field: &str) -> Option<Value>;

    /// Copy the listed fields into a snapshot.
    fn snapshot(&self, fields: &[&str]) -> ContextSnapshot {
        let values = fields
            .iter()
            .filter_map(|field| self.lookup(field).map(|v| (field.to_string(), v)))
            .collect();
        ContextSnapshot(values)
    }
}

/// Context built for one rule activation.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerContext {
    pub tenant_id: String,
    pub source: TriggerKind,
    pub trigger_ref: String,
    pub timestamp: DateTime<Utc>,
    pub event_id: Option<i64>,
    pub event_type: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub from_domain: Option<String>,
    pub has_attachments: Option<bool>,
    pub minute_ref: Option<String>,
}

impl TriggerContext {
    /// Project an event-log entry.
    pub fn from_event(event: &LogEvent) -> Self {
        Self {
            tenant_id: event.tenant_id.clone(),
            source: TriggerKind::Eventlog,
            trigger_ref: eventlog_trigger_ref(event.id),
            timestamp: event.timestamp,
            event_id: Some(event.id),
            event_type: Some(event.event_type.clone()),
            entity_type: Some(event.entity_type.clone()),
            entity_id: event.entity_id.clone(),
            from_domain: event.sender_domain(),
            has_attachments: event.has_attachments(),
            minute_ref: None,
        }
    }

    /// Context for a cron tick at an already minute-truncated instant.
    pub fn for_cron(tenant_id: &str, minute: DateTime<Utc>, minute_ref: String) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            source: TriggerKind::Cron,
            trigger_ref: cron_trigger_ref(&minute_ref),
            timestamp: minute,
            event_id: None,
            event_type: None,
            entity_type: None,
            entity_id: None,
            from_domain: None,
            has_attachments: None,
            minute_ref: Some(minute_ref),
        }
    }
}

impl ContextLookup for TriggerContext {
    fn lookup(&self, field: &str) -> Option<Value> {
        match field {
            "event_id" => self.event_id.map(Value::from),
            "event_type" => self.event_type.clone().map(Value::String),
            "entity_type" => self.entity_type.clone().map(Value::String),
            "entity_id" => self.entity_id.clone().map(Value::String),
            "tenant_id" => Some(Value::String(self.tenant_id.clone())),
            "timestamp" => Some(Value::String(
                self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            )),
            "trigger_ref" => Some(Value::String(self.trigger_ref.clone())),
            "source" => Some(Value::String(self.source.as_str().to_string())),
            "from_domain" => self.from_domain.clone().map(Value::String),
            "has_attachments" => self.has_attachments.map(Value::Bool),
            "minute_ref" => self.minute_ref.clone().map(Value::String),
            _ => None,
        }
    }
}

/// Durable copy of a restricted context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextSnapshot(pub BTreeMap<String, Value>);

impl ContextSnapshot {
    /// Drop every key not in `fields`. Applied when loading snapshots back.
    pub fn restricted(mut self, fields: &[&str]) -> Self {
        self.0.retain(|key, _| fields.contains(&key.as_str()));
        self
    }

    pub fn trigger_ref(&self) -> Option<&str> {
        self.0.get("trigger_ref").and_then(Value::as_str)
    }
}

impl ContextLookup for ContextSnapshot {
    fn lookup(&self, field: &str) -> Option<Value> {
        self.0.get(field).cloned()
    }
}

/// Idempotency reference for an event-log activation.
pub fn eventlog_trigger_ref(event_id: i64) -> String {
    format!("eventlog:{}", event_id)
}

/// Idempotency reference for a cron activation.
pub fn cron_trigger_ref(minute_ref: &str) -> String {
    format!("cron:{}", minute_ref)
}
