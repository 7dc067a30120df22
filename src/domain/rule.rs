//! Rules and their triggers, conditions and actions.
//!
//! Child configs arrive as loosely typed `{type, config}` pairs (import files,
//! API bodies, stored rows) and are parsed into closed enums here, so an
//! unknown tag never reaches dispatch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::action::ActionConfig;
use crate::core::condition::ConditionExpr;
use crate::core::cron::CronSchedule;
use crate::error::{EngineError, Result};

pub const NAME_MAX_CHARS: usize = 200;
pub const DESCRIPTION_MAX_CHARS: usize = 2000;
pub const DEFAULT_MAX_EXECUTIONS_PER_MINUTE: u32 = 10;
pub const MAX_EXECUTIONS_PER_MINUTE_CEILING: u32 = 1000;

/// Activation source of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Eventlog,
    Cron,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Eventlog => "eventlog",
            TriggerKind::Cron => "cron",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eventlog" => Ok(TriggerKind::Eventlog),
            "cron" => Ok(TriggerKind::Cron),
            other => Err(EngineError::Validation(format!("unknown trigger type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventlogTriggerConfig {
    pub allowed_event_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CronTriggerConfig {
    pub cron_expression: String,
}

/// A typed trigger configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum TriggerConfig {
    Eventlog(EventlogTriggerConfig),
    Cron(CronTriggerConfig),
}

impl TriggerConfig {
    pub fn from_parts(kind: &str, config: Value) -> Result<Self> {
        let parsed = Self::decode(kind, config)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Shape-only parse, used when loading stored rows.
    pub fn decode(kind: &str, config: Value) -> Result<Self> {
        let kind: TriggerKind = kind.parse()?;
        let invalid = |e: serde_json::Error| EngineError::Validation(format!("{} trigger config: {}", kind, e));

        Ok(match kind {
            TriggerKind::Eventlog => TriggerConfig::Eventlog(serde_json::from_value(config).map_err(invalid)?),
            TriggerKind::Cron => TriggerConfig::Cron(serde_json::from_value(config).map_err(invalid)?),
        })
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerConfig::Eventlog(_) => TriggerKind::Eventlog,
            TriggerConfig::Cron(_) => TriggerKind::Cron,
        }
    }

    pub fn config_value(&self) -> Result<Value> {
        let value = match self {
            TriggerConfig::Eventlog(c) => serde_json::to_value(c)?,
            TriggerConfig::Cron(c) => serde_json::to_value(c)?,
        };
        Ok(value)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TriggerConfig::Eventlog(c) => {
                if c.allowed_event_types.is_empty() {
                    return Err(EngineError::Validation(
                        "eventlog trigger needs at least one event type".to_string(),
                    ));
                }
                if c.allowed_event_types.iter().any(|t| t.trim().is_empty()) {
                    return Err(EngineError::Validation("event types must not be empty".to_string()));
                }
            }
            TriggerConfig::Cron(c) => {
                CronSchedule::parse(&c.cron_expression)?;
            }
        }
        Ok(())
    }
}

/// Condition kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Recursive boolean expression over the trigger context
    Expression,
}

impl ConditionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionKind::Expression => "expression",
        }
    }
}

impl FromStr for ConditionKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "expression" => Ok(ConditionKind::Expression),
            other => Err(EngineError::Validation(format!("unknown condition type: {}", other))),
        }
    }
}

/// A typed condition configuration.
///
/// The expression stays a JSON tree because the evaluator must fail closed on
/// trees that are malformed at run time; it is checked structurally on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum ConditionConfig {
    Expression(Value),
}

impl ConditionConfig {
    pub fn from_parts(kind: &str, config: Value) -> Result<Self> {
        match kind.parse::<ConditionKind>()? {
            ConditionKind::Expression => {
                let invalid = |e| EngineError::Validation(format!("condition: {}", e));
                let expr = ConditionExpr::parse(&config).map_err(invalid)?;
                expr.validate_for_storage().map_err(invalid)?;
                Ok(ConditionConfig::Expression(config))
            }
        }
    }

    /// Stored trees are loaded as-is; the evaluator fails closed on them.
    pub fn decode(kind: &str, config: Value) -> Result<Self> {
        match kind.parse::<ConditionKind>()? {
            ConditionKind::Expression => Ok(ConditionConfig::Expression(config)),
        }
    }

    pub fn kind(&self) -> ConditionKind {
        match self {
            ConditionConfig::Expression(_) => ConditionKind::Expression,
        }
    }

    pub fn config_value(&self) -> Value {
        match self {
            ConditionConfig::Expression(v) => v.clone(),
        }
    }
}

/// Stored trigger row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trigger {
    pub id: i64,
    #[serde(flatten)]
    pub config: TriggerConfig,
}

/// Stored condition row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub id: i64,
    #[serde(flatten)]
    pub config: ConditionConfig,
}

/// Stored action row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub id: i64,
    #[serde(flatten)]
    pub config: ActionConfig,
}

/// A persisted automation rule with its children
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    pub description: String,
    pub is_enabled: bool,

    /// Incremented on every successful write
    pub version: i64,

    pub max_executions_per_minute: u32,

    /// Why the engine switched the rule off, if it did
    pub disabled_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub triggers: Vec<Trigger>,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

impl Rule {
    /// Whether an eventlog trigger of this rule accepts `event_type`.
    pub fn listens_to(&self, event_type: &str) -> bool {
        self.triggers.iter().any(|t| match &t.config {
            TriggerConfig::Eventlog(c) => c.allowed_event_types.iter().any(|allowed| allowed == event_type),
            TriggerConfig::Cron(_) => false,
        })
    }

    pub fn has_trigger(&self, kind: TriggerKind) -> bool {
        self.triggers.iter().any(|t| t.config.kind() == kind)
    }

    /// Every event type any eventlog trigger accepts
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .triggers
            .iter()
            .filter_map(|t| match &t.config {
                TriggerConfig::Eventlog(c) => Some(c.allowed_event_types.clone()),
                TriggerConfig::Cron(_) => None,
            })
            .flatten()
            .collect();
        types.sort();
        types.dedup();
        types
    }

    pub fn cron_expressions(&self) -> Vec<&str> {
        self.triggers
            .iter()
            .filter_map(|t| match &t.config {
                TriggerConfig::Cron(c) => Some(c.cron_expression.as_str()),
                TriggerConfig::Eventlog(_) => None,
            })
            .collect()
    }

    /// Canonical export document
    pub fn to_document(&self) -> Result<RuleDocument> {
        build_document(
            &self.name,
            &self.description,
            self.max_executions_per_minute,
            self.triggers.iter().map(|t| &t.config),
            self.conditions.iter().map(|c| &c.config),
            self.actions.iter().map(|a| &a.config),
        )
    }

    /// Short content hash of the canonical export, stable across versions
    /// with identical content.
    pub fn fingerprint(&self) -> Result<String> {
        self.to_document()?.fingerprint()
    }
}

/// Validated input for creating a rule
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDraft {
    pub name: String,
    pub description: String,
    pub is_enabled: bool,
    pub max_executions_per_minute: u32,
    pub triggers: Vec<TriggerConfig>,
    pub conditions: Vec<ConditionConfig>,
    pub actions: Vec<ActionConfig>,
}

impl RuleDraft {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_description(&self.description)?;
        validate_rate(self.max_executions_per_minute)?;
        validate_children(&self.triggers, &self.actions)
    }

    /// The document an export of this draft would produce once stored
    pub fn to_document(&self) -> Result<RuleDocument> {
        build_document(
            &self.name,
            &self.description,
            self.max_executions_per_minute,
            self.triggers.iter(),
            self.conditions.iter(),
            self.actions.iter(),
        )
    }
}

fn build_document<'a>(
    name: &str,
    description: &str,
    max_executions_per_minute: u32,
    triggers: impl Iterator<Item = &'a TriggerConfig>,
    conditions: impl Iterator<Item = &'a ConditionConfig>,
    actions: impl Iterator<Item = &'a ActionConfig>,
) -> Result<RuleDocument> {
    Ok(RuleDocument {
        name: name.to_string(),
        description: description.to_string(),
        max_executions_per_minute,
        triggers: triggers
            .map(|t| Ok(ChildDocument::new(t.kind().as_str(), t.config_value()?)))
            .collect::<Result<_>>()?,
        conditions: conditions
            .map(|c| ChildDocument::new(c.kind().as_str(), c.config_value()))
            .collect(),
        actions: actions
            .map(|a| Ok(ChildDocument::new(a.kind().as_str(), a.config_value()?)))
            .collect::<Result<_>>()?,
    })
}

/// Partial update. `None` keeps the stored value; a supplied child list
/// replaces the stored list entirely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RulePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_enabled: Option<bool>,
    pub max_executions_per_minute: Option<u32>,
    pub triggers: Option<Vec<TriggerConfig>>,
    pub conditions: Option<Vec<ConditionConfig>>,
    pub actions: Option<Vec<ActionConfig>>,
}

impl RulePatch {
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(description) = &self.description {
            validate_description(description)?;
        }
        if let Some(rate) = self.max_executions_per_minute {
            validate_rate(rate)?;
        }
        if matches!(&self.triggers, Some(t) if t.is_empty()) {
            return Err(EngineError::Validation("rule needs at least one trigger".to_string()));
        }
        if matches!(&self.actions, Some(a) if a.is_empty()) {
            return Err(EngineError::Validation("rule needs at least one action".to_string()));
        }
        Ok(())
    }
}

/// One `{type, config}` entry of the import/export format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChildDocument {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
}

impl ChildDocument {
    pub fn new(kind: &str, config: Value) -> Self {
        Self {
            kind: kind.to_string(),
            config,
        }
    }
}

fn default_max_executions() -> u32 {
    DEFAULT_MAX_EXECUTIONS_PER_MINUTE
}

/// Canonical import/export representation of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_max_executions")]
    pub max_executions_per_minute: u32,
    #[serde(default)]
    pub triggers: Vec<ChildDocument>,
    #[serde(default)]
    pub conditions: Vec<ChildDocument>,
    #[serde(default)]
    pub actions: Vec<ChildDocument>,
}

impl RuleDocument {
    /// Parse an import document, rejecting unknown top-level keys.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| EngineError::Validation(format!("rule document: {}", e)))
    }

    /// Deterministic JSON text (sorted keys at every level)
    pub fn to_canonical_json(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string(&value)?)
    }

    pub fn fingerprint(&self) -> Result<String> {
        let canonical = self.to_canonical_json()?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(hex::encode(&digest[..8]))
    }

    /// Parse every child and validate the whole rule.
    pub fn into_draft(self) -> Result<RuleDraft> {
        let draft = RuleDraft {
            name: self.name,
            description: self.description,
            is_enabled: true,
            max_executions_per_minute: self.max_executions_per_minute,
            triggers: parse_triggers(self.triggers)?,
            conditions: parse_conditions(self.conditions)?,
            actions: parse_actions(self.actions)?,
        };
        draft.validate()?;
        Ok(draft)
    }
}

/// Patch document accepted by update operations
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulePatchDocument {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_enabled: Option<bool>,
    pub max_executions_per_minute: Option<u32>,
    pub triggers: Option<Vec<ChildDocument>>,
    pub conditions: Option<Vec<ChildDocument>>,
    pub actions: Option<Vec<ChildDocument>>,
}

impl RulePatchDocument {
    pub fn into_patch(self) -> Result<RulePatch> {
        let patch = RulePatch {
            name: self.name,
            description: self.description,
            is_enabled: self.is_enabled,
            max_executions_per_minute: self.max_executions_per_minute,
            triggers: self.triggers.map(parse_triggers).transpose()?,
            conditions: self.conditions.map(parse_conditions).transpose()?,
            actions: self.actions.map(parse_actions).transpose()?,
        };
        patch.validate()?;
        Ok(patch)
    }
}

pub fn parse_triggers(children: Vec<ChildDocument>) -> Result<Vec<TriggerConfig>> {
    children
        .into_iter()
        .map(|c| TriggerConfig::from_parts(&c.kind, c.config))
        .collect()
}

pub fn parse_conditions(children: Vec<ChildDocument>) -> Result<Vec<ConditionConfig>> {
    children
        .into_iter()
        .map(|c| ConditionConfig::from_parts(&c.kind, c.config))
        .collect()
}

pub fn parse_actions(children: Vec<ChildDocument>) -> Result<Vec<ActionConfig>> {
    children
        .into_iter()
        .map(|c| ActionConfig::from_parts(&c.kind, c.config))
        .collect()
}

pub fn validate_tenant(tenant_id: &str) -> Result<()> {
    if tenant_id.trim().is_empty() {
        return Err(EngineError::Validation("tenant_id must not be empty".to_string()));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    let len = name.trim().chars().count();
    if len == 0 || name.chars().count() > NAME_MAX_CHARS {
        return Err(EngineError::Validation(format!(
            "name must be 1-{} characters",
            NAME_MAX_CHARS
        )));
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<()> {
    if description.chars().count() > DESCRIPTION_MAX_CHARS {
        return Err(EngineError::Validation(format!(
            "description must be at most {} characters",
            DESCRIPTION_MAX_CHARS
        )));
    }
    Ok(())
}

fn validate_rate(rate: u32) -> Result<()> {
    if rate == 0 || rate > MAX_EXECUTIONS_PER_MINUTE_CEILING {
        return Err(EngineError::Validation(format!(
            "max_executions_per_minute must be 1-{}",
            MAX_EXECUTIONS_PER_MINUTE_CEILING
        )));
    }
    Ok(())
}

fn validate_children(triggers: &[TriggerConfig], actions: &[ActionConfig]) -> Result<()> {
    if triggers.is_empty() {
        return Err(EngineError::Validation("rule needs at least one trigger".to_string()));
    }
    if actions.is_empty() {
        return Err(EngineError::Validation("rule needs at least one action".to_string()));
    }
    Ok(())
}
