//! Collaborator interfaces for the systems actions take effect in.
//!
//! The engine only relies on the success/failure signature of each
//! collaborator. Bundled implementations:
//! - `local`: SQLite-backed task, postfach, mail, contact and OAuth stores
//! - `webhook`: HTTP delivery over reqwest

pub mod local;
pub mod webhook;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::WebhookMethod;

pub use local::LocalCollaborators;
pub use webhook::HttpWebhookTransport;

/// Failure reported by a collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Worth one retry (timeouts, connection resets, locks)
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying will not help
    #[error("permanent: {0}")]
    Permanent(String),
}

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// A task or follow-up to create
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRequest {
    pub tenant_id: String,
    /// Rule on whose behalf the task is created; tag emitted events with it
    pub rule_id: i64,
    pub followup: bool,
    pub title: String,
    pub description: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
}

/// An internal mailbox draft
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostfachDraftRequest {
    pub tenant_id: String,
    pub rule_id: i64,
    pub subject: String,
    pub body: String,
}

/// An outgoing mail (draft or send)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailRequest {
    pub tenant_id: String,
    pub rule_id: i64,
    pub account_id: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// OAuth credential state of a mail account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OauthCredential {
    pub account_id: String,
    pub expires_at: DateTime<Utc>,
}

impl OauthCredential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A webhook delivery
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub method: WebhookMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// Creates tasks and follow-ups; returns the new task id
#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create_task(&self, request: &TaskRequest) -> CollaboratorResult<String>;
}

/// Creates internal mailbox drafts; returns the draft id
#[async_trait]
pub trait PostfachService: Send + Sync {
    async fn create_draft(&self, request: &PostfachDraftRequest) -> CollaboratorResult<String>;
}

/// Mail drafting and sending on behalf of a tenant
#[async_trait]
pub trait MailService: Send + Sync {
    /// Store a draft; returns the draft id
    async fn create_draft(&self, request: &MailRequest) -> CollaboratorResult<String>;

    /// Send a mail; returns the message id
    async fn send(&self, request: &MailRequest) -> CollaboratorResult<String>;

    /// Current credential of an account, `None` if the account is unknown
    async fn oauth_credential(&self, tenant_id: &str, account_id: &str) -> CollaboratorResult<Option<OauthCredential>>;

    /// Refresh an expired credential
    async fn refresh_credential(&self, tenant_id: &str, account_id: &str) -> CollaboratorResult<OauthCredential>;
}

/// CRM contact lookup
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn has_contact(&self, tenant_id: &str, email: &str) -> CollaboratorResult<bool>;
}

/// Delivers webhooks; returns the HTTP status
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, request: &WebhookRequest) -> CollaboratorResult<u16>;
}

/// Every collaborator the executor needs
#[derive(Clone)]
pub struct Collaborators {
    pub tasks: Arc<dyn TaskService>,
    pub postfach: Arc<dyn PostfachService>,
    pub mail: Arc<dyn MailService>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub webhooks: Arc<dyn WebhookTransport>,
}

impl Collaborators {
    /// Local SQLite collaborators plus HTTP webhook delivery
    pub fn local(local: Arc<LocalCollaborators>, webhooks: Arc<dyn WebhookTransport>) -> Self {
        Self {
            tasks: local.clone(),
            postfach: local.clone(),
            mail: local.clone(),
            contacts: local,
            webhooks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_credential_expiry() {
        let now = Utc::now();
        let credential = OauthCredential {
            account_id: "acc".to_string(),
            expires_at: now + Duration::minutes(5),
        };
        assert!(!credential.is_expired_at(now));
        assert!(credential.is_expired_at(now + Duration::minutes(5)));
    }
}
