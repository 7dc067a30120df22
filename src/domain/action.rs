//! The closed action taxonomy and its typed configurations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Every action kind the engine can dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateTask,
    CreateFollowup,
    CreatePostfachDraft,
    EmailDraft,
    EmailSend,
    Webhook,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::CreateTask,
        ActionKind::CreateFollowup,
        ActionKind::CreatePostfachDraft,
        ActionKind::EmailDraft,
        ActionKind::EmailSend,
        ActionKind::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateTask => "create_task",
            ActionKind::CreateFollowup => "create_followup",
            ActionKind::CreatePostfachDraft => "create_postfach_draft",
            ActionKind::EmailDraft => "email_draft",
            ActionKind::EmailSend => "email_send",
            ActionKind::Webhook => "webhook",
        }
    }

    /// Kinds that can never run without a human confirming them.
    pub fn always_requires_confirm(&self) -> bool {
        matches!(
            self,
            ActionKind::CreatePostfachDraft | ActionKind::EmailDraft | ActionKind::EmailSend
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EngineError::ActionNotAllowed(s.to_string()))
    }
}

/// Config for `create_task` and `create_followup`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskActionConfig {
    /// Title template
    pub title: String,

    /// Optional description template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Due date offset from the moment the task is created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_in_days: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_confirm: Option<bool>,
}

/// Config for `create_postfach_draft` (internal mailbox message)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostfachDraftConfig {
    pub subject: String,
    pub body: String,

    /// Accepted for schema symmetry; postfach drafts always need confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_confirm: Option<bool>,
}

/// Config for `email_draft` and `email_send`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailActionConfig {
    /// Recipients; each must be a known contact of the tenant
    pub to: Vec<String>,

    /// Subject template
    pub subject: String,

    /// Body template
    pub body: String,

    /// Mail account to draft in / send from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    /// Accepted for schema symmetry; mail actions always need confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_confirm: Option<bool>,
}

/// HTTP methods a webhook may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl WebhookMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookMethod::Post => "POST",
            WebhookMethod::Put => "PUT",
            WebhookMethod::Patch => "PATCH",
        }
    }
}

/// Config for `webhook`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookActionConfig {
    pub url: String,

    #[serde(default)]
    pub method: WebhookMethod,

    /// Extra request headers; credential-style names are refused at dispatch
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Extra body fields, each a template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_confirm: Option<bool>,
}

/// A typed action configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum ActionConfig {
    CreateTask(TaskActionConfig),
    CreateFollowup(TaskActionConfig),
    CreatePostfachDraft(PostfachDraftConfig),
    EmailDraft(EmailActionConfig),
    EmailSend(EmailActionConfig),
    Webhook(WebhookActionConfig),
}

impl ActionConfig {
    /// Parse a `{type, config}` pair from the import/storage boundary.
    pub fn from_parts(kind: &str, config: Value) -> Result<Self> {
        let parsed = Self::decode(kind, config)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Shape-only parse, used when loading stored rows.
    pub fn decode(kind: &str, config: Value) -> Result<Self> {
        let kind: ActionKind = kind.parse()?;
        let config = if config.is_null() { Value::Object(Default::default()) } else { config };
        let invalid = |e: serde_json::Error| EngineError::Validation(format!("{} config: {}", kind, e));

        let parsed = match kind {
            ActionKind::CreateTask => ActionConfig::CreateTask(serde_json::from_value(config).map_err(invalid)?),
            ActionKind::CreateFollowup => {
                ActionConfig::CreateFollowup(serde_json::from_value(config).map_err(invalid)?)
            }
            ActionKind::CreatePostfachDraft => {
                ActionConfig::CreatePostfachDraft(serde_json::from_value(config).map_err(invalid)?)
            }
            ActionKind::EmailDraft => ActionConfig::EmailDraft(serde_json::from_value(config).map_err(invalid)?),
            ActionKind::EmailSend => ActionConfig::EmailSend(serde_json::from_value(config).map_err(invalid)?),
            ActionKind::Webhook => ActionConfig::Webhook(serde_json::from_value(config).map_err(invalid)?),
        };
        Ok(parsed)
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            ActionConfig::CreateTask(_) => ActionKind::CreateTask,
            ActionConfig::CreateFollowup(_) => ActionKind::CreateFollowup,
            ActionConfig::CreatePostfachDraft(_) => ActionKind::CreatePostfachDraft,
            ActionConfig::EmailDraft(_) => ActionKind::EmailDraft,
            ActionConfig::EmailSend(_) => ActionKind::EmailSend,
            ActionConfig::Webhook(_) => ActionKind::Webhook,
        }
    }

    /// Canonical config object (sorted keys, defaults made explicit where
    /// serialized).
    pub fn config_value(&self) -> Result<Value> {
        let value = match self {
            ActionConfig::CreateTask(c) | ActionConfig::CreateFollowup(c) => serde_json::to_value(c)?,
            ActionConfig::CreatePostfachDraft(c) => serde_json::to_value(c)?,
            ActionConfig::EmailDraft(c) | ActionConfig::EmailSend(c) => serde_json::to_value(c)?,
            ActionConfig::Webhook(c) => serde_json::to_value(c)?,
        };
        Ok(value)
    }

    /// Confirm-gate policy.
    ///
    /// Mail and postfach actions always require confirmation whatever the
    /// config says. Everything else requires it unless `requires_confirm` is
    /// explicitly `false`.
    pub fn requires_confirmation(&self) -> bool {
        if self.kind().always_requires_confirm() {
            return true;
        }
        match self {
            ActionConfig::CreateTask(c) | ActionConfig::CreateFollowup(c) => c.requires_confirm != Some(false),
            ActionConfig::Webhook(c) => c.requires_confirm != Some(false),
            _ => true,
        }
    }

    /// Structural checks done at store-write time.
    ///
    /// Policy checks that depend on runtime state (contact directory, domain
    /// allow-list, OAuth) happen at dispatch.
    pub fn validate(&self) -> Result<()> {
        match self {
            ActionConfig::CreateTask(c) | ActionConfig::CreateFollowup(c) => {
                require_text("title", &c.title)?;
            }
            ActionConfig::CreatePostfachDraft(c) => {
                require_text("subject", &c.subject)?;
                require_text("body", &c.body)?;
            }
            ActionConfig::EmailDraft(c) | ActionConfig::EmailSend(c) => {
                if c.to.is_empty() {
                    return Err(EngineError::Validation(format!("{} needs at least one recipient", self.kind())));
                }
                for address in &c.to {
                    if !looks_like_email(address) {
                        return Err(EngineError::Validation(format!("{} has an invalid recipient", self.kind())));
                    }
                }
                require_text("subject", &c.subject)?;
                require_text("body", &c.body)?;
                if matches!(self, ActionConfig::EmailSend(_)) && c.account_id.as_deref().map_or(true, str::is_empty) {
                    return Err(EngineError::Validation("email_send needs an account_id".to_string()));
                }
            }
            ActionConfig::Webhook(c) => {
                let url = reqwest::Url::parse(&c.url)
                    .map_err(|e| EngineError::Validation(format!("webhook url: {}", e)))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(EngineError::Validation(format!(
                        "webhook url scheme not supported: {}",
                        url.scheme()
                    )));
                }
                if url.host_str().is_none() {
                    return Err(EngineError::Validation("webhook url has no host".to_string()));
                }
            }
        }
        Ok(())
    }
}

fn require_text(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{} must not be empty", name)));
    }
    Ok(())
}

fn looks_like_email(address: &str) -> bool {
    match address.trim().split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.contains('@'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_kind_is_not_allowed() {
        let err = ActionConfig::from_parts("shell_exec", json!({})).unwrap_err();
        assert_eq!(err.code(), "action_not_allowed");
    }

    #[test]
    fn test_unknown_config_key_is_validation_error() {
        let err = ActionConfig::from_parts("create_task", json!({"title": "x", "assignee": "bob"})).unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn test_confirm_gate_policy() {
        let task = ActionConfig::from_parts("create_task", json!({"title": "x", "requires_confirm": false})).unwrap();
        assert!(!task.requires_confirmation());

        let task_default = ActionConfig::from_parts("create_task", json!({"title": "x"})).unwrap();
        assert!(task_default.requires_confirmation());

        let draft = ActionConfig::from_parts(
            "email_draft",
            json!({"to": ["a@b.de"], "subject": "s", "body": "b", "requires_confirm": false}),
        )
        .unwrap();
        assert!(draft.requires_confirmation());

        let hook = ActionConfig::from_parts(
            "webhook",
            json!({"url": "https://hooks.example.com/x", "requires_confirm": false}),
        )
        .unwrap();
        assert!(!hook.requires_confirmation());
    }

    #[test]
    fn test_email_send_requires_account() {
        let err = ActionConfig::from_parts("email_send", json!({"to": ["a@b.de"], "subject": "s", "body": "b"}))
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn test_webhook_scheme() {
        let err = ActionConfig::from_parts("webhook", json!({"url": "ftp://example.com/x"})).unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn test_canonical_config_sorted() {
        let action = ActionConfig::from_parts(
            "create_task",
            json!({"title": "Follow up", "requires_confirm": false, "due_in_days": 2}),
        )
        .unwrap();
        let text = serde_json::to_string(&action.config_value().unwrap()).unwrap();
        assert_eq!(text, r#"{"due_in_days":2,"requires_confirm":false,"title":"Follow up"}"#);
    }
}
