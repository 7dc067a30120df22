//! SQLite-backed collaborators for single-node deployments and tests.
//!
//! Effects land in `local_*` tables of the engine database. Tasks, postfach
//! drafts and sent mail also append an event tagged with the originating rule
//! so downstream rules see them (and the loop guard can recognize them).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::json;

use super::{
    CollaboratorError, CollaboratorResult, ContactDirectory, MailRequest, MailService, OauthCredential,
    PostfachDraftRequest, PostfachService, TaskRequest, TaskService,
};
use crate::domain::events::ORIGIN_RULE_KEY;
use crate::domain::LogEvent;
use crate::error::EngineError;
use crate::store::{encode_ts, Database};

/// How long a refreshed local credential stays valid
const REFRESH_VALIDITY_MINUTES: i64 = 60;

fn storage_error(err: EngineError) -> CollaboratorError {
    if err.is_transient() {
        CollaboratorError::Transient("storage_locked".to_string())
    } else {
        CollaboratorError::Permanent("storage".to_string())
    }
}

/// Local collaborators over the engine database
#[derive(Clone)]
pub struct LocalCollaborators {
    db: Database,
}

impl LocalCollaborators {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a CRM contact
    pub fn add_contact(&self, tenant_id: &str, email: &str, name: &str) -> crate::error::Result<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO local_contacts (tenant_id, email, name) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (tenant_id, email) DO UPDATE SET name = excluded.name",
                params![tenant_id, email.trim().to_ascii_lowercase(), name],
            )?;
            Ok(())
        })
    }

    /// Register or update a mail account credential
    pub fn add_oauth_account(
        &self,
        tenant_id: &str,
        account_id: &str,
        expires_at: DateTime<Utc>,
        refreshable: bool,
    ) -> crate::error::Result<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO local_oauth_accounts (tenant_id, account_id, expires_at, refreshable) \
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT (tenant_id, account_id) \
                 DO UPDATE SET expires_at = excluded.expires_at, refreshable = excluded.refreshable",
                params![tenant_id, account_id, encode_ts(&expires_at), refreshable],
            )?;
            Ok(())
        })
    }

    /// Number of local tasks of a tenant
    pub fn task_count(&self, tenant_id: &str) -> crate::error::Result<i64> {
        self.count("local_tasks", tenant_id)
    }

    /// Number of local mail rows (drafts and sent) of a tenant
    pub fn mail_count(&self, tenant_id: &str) -> crate::error::Result<i64> {
        self.count("local_mail", tenant_id)
    }

    fn count(&self, table: &str, tenant_id: &str) -> crate::error::Result<i64> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE tenant_id = ?1", table),
                params![tenant_id],
                |row| row.get(0),
            )?)
        })
    }

    fn emit(&self, tenant_id: &str, rule_id: i64, event_type: &str, entity_type: &str, entity_id: &str) {
        let mut payload = serde_json::Map::new();
        payload.insert(ORIGIN_RULE_KEY.to_string(), json!(rule_id));
        let event = LogEvent::new(
            tenant_id,
            event_type,
            entity_type,
            Some(entity_id.to_string()),
            serde_json::Value::Object(payload),
        );
        if let Err(e) = self.db.append_event(&event) {
            tracing::warn!(tenant_id, event_type, error = %e.code(), "Failed to append collaborator event");
        }
    }

    fn insert_mail(&self, request: &MailRequest, status: &str) -> CollaboratorResult<i64> {
        self.db
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO local_mail (tenant_id, rule_id, account_id, recipients, subject, body, status, \
                     created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        request.tenant_id,
                        request.rule_id,
                        request.account_id,
                        serde_json::to_string(&request.to)?,
                        request.subject,
                        request.body,
                        status,
                        encode_ts(&Utc::now())
                    ],
                )?;
                Ok(tx.last_insert_rowid())
            })
            .map_err(storage_error)
    }
}

#[async_trait]
impl TaskService for LocalCollaborators {
    async fn create_task(&self, request: &TaskRequest) -> CollaboratorResult<String> {
        let kind = if request.followup { "followup" } else { "task" };
        let id = self
            .db
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO local_tasks (tenant_id, rule_id, kind, title, description, due_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        request.tenant_id,
                        request.rule_id,
                        kind,
                        request.title,
                        request.description,
                        request.due_at.as_ref().map(encode_ts),
                        encode_ts(&Utc::now())
                    ],
                )?;
                Ok(tx.last_insert_rowid())
            })
            .map_err(storage_error)?;

        let reference = format!("{}-{}", kind, id);
        self.emit(&request.tenant_id, request.rule_id, &format!("{}.created", kind), kind, &reference);
        Ok(reference)
    }
}

#[async_trait]
impl PostfachService for LocalCollaborators {
    async fn create_draft(&self, request: &PostfachDraftRequest) -> CollaboratorResult<String> {
        let id = self
            .db
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO local_postfach (tenant_id, rule_id, subject, body, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        request.tenant_id,
                        request.rule_id,
                        request.subject,
                        request.body,
                        encode_ts(&Utc::now())
                    ],
                )?;
                Ok(tx.last_insert_rowid())
            })
            .map_err(storage_error)?;

        let reference = format!("postfach-{}", id);
        self.emit(&request.tenant_id, request.rule_id, "postfach.draft_created", "postfach", &reference);
        Ok(reference)
    }
}

#[async_trait]
impl MailService for LocalCollaborators {
    async fn create_draft(&self, request: &MailRequest) -> CollaboratorResult<String> {
        let id = self.insert_mail(request, "draft")?;
        Ok(format!("draft-{}", id))
    }

    async fn send(&self, request: &MailRequest) -> CollaboratorResult<String> {
        let id = self.insert_mail(request, "sent")?;
        let reference = format!("msg-{}", id);
        self.emit(&request.tenant_id, request.rule_id, "email.sent", "email", &reference);
        Ok(reference)
    }

    async fn oauth_credential(&self, tenant_id: &str, account_id: &str) -> CollaboratorResult<Option<OauthCredential>> {
        let expires: Option<String> = self
            .db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT expires_at FROM local_oauth_accounts WHERE tenant_id = ?1 AND account_id = ?2",
                        params![tenant_id, account_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .map_err(storage_error)?;

        expires
            .map(|text| {
                DateTime::parse_from_rfc3339(&text)
                    .map(|t| OauthCredential {
                        account_id: account_id.to_string(),
                        expires_at: t.with_timezone(&Utc),
                    })
                    .map_err(|_| CollaboratorError::Permanent("oauth_corrupt".to_string()))
            })
            .transpose()
    }

    async fn refresh_credential(&self, tenant_id: &str, account_id: &str) -> CollaboratorResult<OauthCredential> {
        let expires_at = Utc::now() + Duration::minutes(REFRESH_VALIDITY_MINUTES);
        let changed = self
            .db
            .with_tx(|tx| {
                Ok(tx.execute(
                    "UPDATE local_oauth_accounts SET expires_at = ?1 \
                     WHERE tenant_id = ?2 AND account_id = ?3 AND refreshable = 1",
                    params![encode_ts(&expires_at), tenant_id, account_id],
                )?)
            })
            .map_err(storage_error)?;

        if changed == 0 {
            return Err(CollaboratorError::Permanent("oauth_refresh_rejected".to_string()));
        }
        Ok(OauthCredential {
            account_id: account_id.to_string(),
            expires_at,
        })
    }
}

#[async_trait]
impl ContactDirectory for LocalCollaborators {
    async fn has_contact(&self, tenant_id: &str, email: &str) -> CollaboratorResult<bool> {
        self.db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT 1 FROM local_contacts WHERE tenant_id = ?1 AND email = ?2",
                        params![tenant_id, email.trim().to_ascii_lowercase()],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some())
            })
            .map_err(storage_error)
    }
}
