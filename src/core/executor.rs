//! Action dispatch: policy checks, the confirm gate, and real effects.
//!
//! Every action goes through [`ActionExecutor::prepare`] first, which renders
//! templates and runs all policy checks without side effects. Only a prepared
//! effect is either persisted as a pending action or performed.

use std::future::Future;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::retry::RetryPolicy;
use super::safety::SafetyLimits;
use super::template::{check_placeholders, render};
use crate::adapters::{
    CollaboratorError, CollaboratorResult, Collaborators, MailRequest, PostfachDraftRequest, TaskRequest,
    WebhookRequest,
};
use crate::domain::pending::generate_confirm_token;
use crate::domain::{
    ActionConfig, ActionKind, ContextLookup, EmailActionConfig, NewPendingAction, PendingAction, SNAPSHOT_FIELDS,
    TEMPLATE_FIELDS,
};
use crate::error::{EngineError, Result};
use crate::store::Database;

/// Result of dispatching one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The effect happened; `reference` is the collaborator's identifier
    Executed { reference: String },

    /// Waiting for confirmation
    Pending { pending_id: i64 },

    /// Rejected by policy or failed at the collaborator
    Failed { error: String },
}

impl ActionOutcome {
    /// Redacted one-line summary (`kind:status[:detail]`)
    pub fn summary(&self, kind: ActionKind) -> String {
        match self {
            ActionOutcome::Executed { reference } => format!("{}:ok:{}", kind, reference),
            ActionOutcome::Pending { pending_id } => format!("{}:pending:{}", kind, pending_id),
            ActionOutcome::Failed { error } => format!("{}:failed:{}", kind, error),
        }
    }
}

/// What dispatch would do, without doing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum ActionPlan {
    WouldExecute,
    WouldPend,
    WouldFail { error: String },
}

/// A rendered, policy-checked effect ready to perform
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedEffect {
    Task(TaskRequest),
    Postfach(PostfachDraftRequest),
    MailDraft(MailRequest),
    MailSend(MailRequest),
    Webhook(WebhookRequest),
}

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub limits: SafetyLimits,

    /// Retry for transient collaborator failures
    pub collaborator_retry: RetryPolicy,

    /// Retry for webhook 5xx responses and transport failures
    pub webhook_retry: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            limits: SafetyLimits::default(),
            collaborator_retry: RetryPolicy::default(),
            webhook_retry: RetryPolicy::default(),
        }
    }
}

/// Dispatches allow-listed actions
#[derive(Clone)]
pub struct ActionExecutor {
    db: Database,
    collaborators: Collaborators,
    settings: ExecutorSettings,
}

impl ActionExecutor {
    pub fn new(db: Database, collaborators: Collaborators, settings: ExecutorSettings) -> Self {
        Self {
            db,
            collaborators,
            settings,
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.settings.limits
    }

    /// Dispatch one action of a rule.
    ///
    /// Policy and collaborator failures become [`ActionOutcome::Failed`]. `Err`
    /// is reserved for storage failures, which abort the batch.
    pub async fn dispatch<C>(
        &self,
        tenant_id: &str,
        rule_id: i64,
        action: &ActionConfig,
        ctx: &C,
    ) -> Result<ActionOutcome>
    where
        C: ContextLookup + Sync + ?Sized,
    {
        let kind = action.kind();
        let effect = match self.prepare(tenant_id, rule_id, action, ctx).await {
            Ok(effect) => effect,
            Err(e) if is_storage_failure(&e) => return Err(e),
            Err(e) => {
                debug!(rule_id, action = %kind, error = %e.code(), "Action rejected");
                return Ok(ActionOutcome::Failed { error: e.code() });
            }
        };

        if action.requires_confirmation() {
            let pending = self.db.insert_pending(&NewPendingAction {
                tenant_id: tenant_id.to_string(),
                rule_id,
                action_config: action.clone(),
                context_snapshot: ctx.snapshot(SNAPSHOT_FIELDS),
                confirm_token: generate_confirm_token(),
            })?;
            debug!(rule_id, action = %kind, pending_id = pending.id, "Action awaiting confirmation");
            return Ok(ActionOutcome::Pending { pending_id: pending.id });
        }

        match self.perform(&effect).await {
            Ok(reference) => {
                debug!(rule_id, action = %kind, "Action executed");
                Ok(ActionOutcome::Executed { reference })
            }
            Err(e) => {
                warn!(rule_id, action = %kind, error = %e.code(), "Action failed");
                Ok(ActionOutcome::Failed { error: e.code() })
            }
        }
    }

    /// What [`dispatch`](Self::dispatch) would do. No effect, no persistence.
    pub async fn plan<C>(&self, tenant_id: &str, rule_id: i64, action: &ActionConfig, ctx: &C) -> ActionPlan
    where
        C: ContextLookup + Sync + ?Sized,
    {
        match self.prepare(tenant_id, rule_id, action, ctx).await {
            Err(e) => ActionPlan::WouldFail { error: e.code() },
            Ok(_) if action.requires_confirmation() => ActionPlan::WouldPend,
            Ok(_) => ActionPlan::WouldExecute,
        }
    }

    /// Run the effect of a confirmed pending action against its snapshot.
    /// Policy checks run again; the world may have changed since proposal.
    pub async fn perform_confirmed(&self, pending: &PendingAction) -> Result<String> {
        let effect = self
            .prepare(&pending.tenant_id, pending.rule_id, &pending.action_config, &pending.context_snapshot)
            .await?;
        self.perform(&effect).await
    }

    /// Render templates and run every policy check.
    pub async fn prepare<C>(
        &self,
        tenant_id: &str,
        rule_id: i64,
        action: &ActionConfig,
        ctx: &C,
    ) -> Result<PreparedEffect>
    where
        C: ContextLookup + Sync + ?Sized,
    {
        let limits = &self.settings.limits;
        match action {
            ActionConfig::CreateTask(c) | ActionConfig::CreateFollowup(c) => {
                let templates: Vec<&str> = std::iter::once(c.title.as_str()).chain(c.description.as_deref()).collect();
                check_placeholders(&templates, TEMPLATE_FIELDS)?;
                let title = render(&c.title, ctx, TEMPLATE_FIELDS)?;
                limits.validate_subject(&title)?;
                let description = c
                    .description
                    .as_deref()
                    .map(|d| render(d, ctx, TEMPLATE_FIELDS))
                    .transpose()?;
                if let Some(d) = &description {
                    limits.validate_body(d)?;
                }
                Ok(PreparedEffect::Task(TaskRequest {
                    tenant_id: tenant_id.to_string(),
                    rule_id,
                    followup: matches!(action, ActionConfig::CreateFollowup(_)),
                    title,
                    description,
                    due_at: c.due_in_days.map(|days| Utc::now() + Duration::days(i64::from(days))),
                }))
            }
            ActionConfig::CreatePostfachDraft(c) => {
                let (subject, body) = self.render_mail_text(&c.subject, &c.body, ctx)?;
                Ok(PreparedEffect::Postfach(PostfachDraftRequest {
                    tenant_id: tenant_id.to_string(),
                    rule_id,
                    subject,
                    body,
                }))
            }
            ActionConfig::EmailDraft(c) => {
                let request = self.prepare_mail(tenant_id, rule_id, c, ctx).await?;
                Ok(PreparedEffect::MailDraft(request))
            }
            ActionConfig::EmailSend(c) => {
                let request = self.prepare_mail(tenant_id, rule_id, c, ctx).await?;
                let account_id = request.account_id.clone().unwrap_or_default();
                let mail = &self.collaborators.mail;
                let (tenant, account) = (tenant_id, account_id.as_str());
                let credential = self
                    .call_with_retry("oauth_credential", move || mail.oauth_credential(tenant, account))
                    .await?;
                if credential.is_none() {
                    return Err(EngineError::OauthAccountUnavailable(account_id));
                }
                Ok(PreparedEffect::MailSend(request))
            }
            ActionConfig::Webhook(c) => {
                let url = limits.check_webhook_url(&c.url)?;
                limits.validate_headers(c.headers.keys())?;

                let templates: Vec<&str> = c.fields.values().map(String::as_str).collect();
                check_placeholders(&templates, TEMPLATE_FIELDS)?;
                let mut fields = Map::new();
                for (name, template) in &c.fields {
                    fields.insert(name.clone(), Value::String(render(template, ctx, TEMPLATE_FIELDS)?));
                }

                let body = json!({
                    "rule_id": rule_id,
                    "trigger_ref": ctx.lookup("trigger_ref"),
                    "event": ctx.snapshot(TEMPLATE_FIELDS),
                    "fields": fields,
                });
                Ok(PreparedEffect::Webhook(WebhookRequest {
                    url: url.to_string(),
                    method: c.method,
                    headers: c.headers.clone(),
                    body,
                }))
            }
        }
    }

    async fn prepare_mail<C>(
        &self,
        tenant_id: &str,
        rule_id: i64,
        c: &EmailActionConfig,
        ctx: &C,
    ) -> Result<MailRequest>
    where
        C: ContextLookup + Sync + ?Sized,
    {
        let contacts = &self.collaborators.contacts;
        for recipient in &c.to {
            let address = recipient.as_str();
            let known = self
                .call_with_retry("contact_lookup", move || contacts.has_contact(tenant_id, address))
                .await?;
            if !known {
                return Err(EngineError::RecipientNotInCrm);
            }
        }

        let (subject, body) = self.render_mail_text(&c.subject, &c.body, ctx)?;
        Ok(MailRequest {
            tenant_id: tenant_id.to_string(),
            rule_id,
            account_id: c.account_id.clone(),
            to: c.to.clone(),
            subject,
            body,
        })
    }

    fn render_mail_text<C>(&self, subject: &str, body: &str, ctx: &C) -> Result<(String, String)>
    where
        C: ContextLookup + ?Sized,
    {
        check_placeholders(&[subject, body], TEMPLATE_FIELDS)?;
        let subject = render(subject, ctx, TEMPLATE_FIELDS)?;
        let body = render(body, ctx, TEMPLATE_FIELDS)?;
        self.settings.limits.validate_subject(&subject)?;
        self.settings.limits.validate_body(&body)?;
        Ok((subject, body))
    }

    /// Perform a prepared effect; returns the collaborator reference.
    pub async fn perform(&self, effect: &PreparedEffect) -> Result<String> {
        let c = &self.collaborators;
        match effect {
            PreparedEffect::Task(req) => self.call_with_retry("create_task", move || c.tasks.create_task(req)).await,
            PreparedEffect::Postfach(req) => {
                self.call_with_retry("postfach_draft", move || c.postfach.create_draft(req))
                    .await
            }
            PreparedEffect::MailDraft(req) => {
                self.call_with_retry("mail_draft", move || c.mail.create_draft(req))
                    .await
            }
            PreparedEffect::MailSend(req) => {
                self.ensure_credential(&req.tenant_id, req.account_id.as_deref().unwrap_or_default())
                    .await?;
                self.call_with_retry("mail_send", move || c.mail.send(req)).await
            }
            PreparedEffect::Webhook(req) => self.deliver_webhook(req).await,
        }
    }

    /// A live credential, refreshing an expired one once.
    async fn ensure_credential(&self, tenant_id: &str, account_id: &str) -> Result<()> {
        let unavailable = || EngineError::OauthAccountUnavailable(account_id.to_string());
        let mail = &self.collaborators.mail;

        let credential = self
            .call_with_retry("oauth_credential", move || mail.oauth_credential(tenant_id, account_id))
            .await?
            .ok_or_else(unavailable)?;
        if !credential.is_expired_at(Utc::now()) {
            return Ok(());
        }

        debug!(account_id, "OAuth credential expired, refreshing");
        match mail.refresh_credential(tenant_id, account_id).await {
            Ok(refreshed) if !refreshed.is_expired_at(Utc::now()) => Ok(()),
            Ok(_) | Err(_) => Err(unavailable()),
        }
    }

    /// 2xx succeeds. 5xx and transport hiccups are retried once; 4xx never.
    async fn deliver_webhook(&self, request: &WebhookRequest) -> Result<String> {
        let policy = &self.settings.webhook_retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let can_retry = policy.should_retry(attempt);

            let failure = match self.collaborators.webhooks.deliver(request).await {
                Ok(status) if (200..300).contains(&status) => return Ok(format!("http_{}", status)),
                Ok(status) if status >= 500 => {
                    if !can_retry {
                        return Err(EngineError::WebhookTransientHttp(status));
                    }
                    format!("http_{}", status)
                }
                Ok(status) => return Err(EngineError::WebhookHttp(status)),
                Err(CollaboratorError::Transient(detail)) if can_retry => detail,
                Err(e) => return Err(e.into()),
            };

            let delay = policy.delay();
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                failure = %failure,
                "Webhook delivery failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Call a collaborator, retrying a transient failure once.
    async fn call_with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CollaboratorResult<T>>,
    {
        let policy = &self.settings.collaborator_retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(CollaboratorError::Transient(detail)) if policy.should_retry(attempt) => {
                    let delay = policy.delay();
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        detail = %detail,
                        "Collaborator call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Engine-side storage failures (as opposed to collaborator failures)
fn is_storage_failure(err: &EngineError) -> bool {
    matches!(err, EngineError::Database(_) | EngineError::Serialization(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_summary() {
        assert_eq!(
            ActionOutcome::Executed {
                reference: "task-1".to_string()
            }
            .summary(ActionKind::CreateTask),
            "create_task:ok:task-1"
        );
        assert_eq!(
            ActionOutcome::Pending { pending_id: 4 }.summary(ActionKind::EmailDraft),
            "email_draft:pending:4"
        );
        assert_eq!(
            ActionOutcome::Failed {
                error: "webhook_http_404".to_string()
            }
            .summary(ActionKind::Webhook),
            "webhook:failed:webhook_http_404"
        );
    }

    #[test]
    fn test_storage_failures_are_distinguished() {
        assert!(is_storage_failure(&EngineError::Database("disk".to_string())));
        assert!(!is_storage_failure(&EngineError::RecipientNotInCrm));
        assert!(!is_storage_failure(&EngineError::Transient("timeout".to_string())));
    }
}
