//! Pending-action persistence and the single-use claim.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{encode_ts, json_column, opt_ts_column, ts_column, Database};
use crate::domain::execution::redact;
use crate::domain::{ActionConfig, ContextSnapshot, NewPendingAction, PendingAction, SNAPSHOT_FIELDS};
use crate::error::{EngineError, Result};

const PENDING_COLUMNS: &str = "id, tenant_id, rule_id, action_type, action_config, context_snapshot, confirm_token, \
                               created_at, confirmed_at, last_error, result_redacted";

struct PendingRow {
    id: i64,
    tenant_id: String,
    rule_id: i64,
    action_type: String,
    action_config: serde_json::Value,
    context_snapshot: serde_json::Value,
    confirm_token: String,
    created_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    result_redacted: Option<String>,
}

fn map_pending_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingRow> {
    Ok(PendingRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        rule_id: row.get(2)?,
        action_type: row.get(3)?,
        action_config: json_column(row, 4)?,
        context_snapshot: json_column(row, 5)?,
        confirm_token: row.get(6)?,
        created_at: ts_column(row, 7)?,
        confirmed_at: opt_ts_column(row, 8)?,
        last_error: row.get(9)?,
        result_redacted: row.get(10)?,
    })
}

impl PendingRow {
    fn into_pending(self) -> Result<PendingAction> {
        let action_config = ActionConfig::decode(&self.action_type, self.action_config)?;
        let context_snapshot: ContextSnapshot = serde_json::from_value(self.context_snapshot)?;
        Ok(PendingAction {
            id: self.id,
            tenant_id: self.tenant_id,
            rule_id: self.rule_id,
            action_type: action_config.kind(),
            action_config,
            context_snapshot: context_snapshot.restricted(SNAPSHOT_FIELDS),
            confirm_token: self.confirm_token,
            created_at: self.created_at,
            confirmed_at: self.confirmed_at,
            last_error: self.last_error,
            result_redacted: self.result_redacted,
        })
    }
}

fn fetch_pending(conn: &Connection, tenant_id: &str, pending_id: i64) -> Result<PendingAction> {
    let sql = format!("SELECT {} FROM pending_actions WHERE tenant_id = ?1 AND id = ?2", PENDING_COLUMNS);
    conn.query_row(&sql, params![tenant_id, pending_id], map_pending_row)
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("pending action {}", pending_id)))?
        .into_pending()
}

impl Database {
    /// Persist a proposal with its restricted context snapshot.
    pub fn insert_pending(&self, new: &NewPendingAction) -> Result<PendingAction> {
        let snapshot = new.context_snapshot.clone().restricted(SNAPSHOT_FIELDS);
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO pending_actions (tenant_id, rule_id, action_type, action_config, context_snapshot, \
                 confirm_token, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.tenant_id,
                    new.rule_id,
                    new.action_config.kind().as_str(),
                    serde_json::to_string(&new.action_config.config_value()?)?,
                    serde_json::to_string(&snapshot)?,
                    new.confirm_token,
                    encode_ts(&Utc::now())
                ],
            )?;
            fetch_pending(tx, &new.tenant_id, tx.last_insert_rowid())
        })
    }

    /// Load a pending action; ids of other tenants are `NotFound`.
    pub fn get_pending(&self, tenant_id: &str, pending_id: i64) -> Result<PendingAction> {
        self.with_conn(|conn| fetch_pending(conn, tenant_id, pending_id))
    }

    /// Newest-first pending actions of a tenant
    pub fn list_pending(&self, tenant_id: &str, include_confirmed: bool) -> Result<Vec<PendingAction>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM pending_actions WHERE tenant_id = ?1 {} ORDER BY id DESC",
                PENDING_COLUMNS,
                if include_confirmed { "" } else { "AND confirmed_at IS NULL" }
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![tenant_id], map_pending_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(PendingRow::into_pending).collect()
        })
    }

    /// Stamp `confirmed_at` if nobody else has. Returns whether this caller won.
    pub fn claim_pending(&self, tenant_id: &str, pending_id: i64, now: DateTime<Utc>) -> Result<bool> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE pending_actions SET confirmed_at = ?1 \
                 WHERE tenant_id = ?2 AND id = ?3 AND confirmed_at IS NULL",
                params![encode_ts(&now), tenant_id, pending_id],
            )?;
            Ok(changed == 1)
        })
    }

    /// Undo a claim after the effect failed, recording the error code.
    pub fn release_pending(&self, tenant_id: &str, pending_id: i64, error_code: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE pending_actions SET confirmed_at = NULL, last_error = ?1 WHERE tenant_id = ?2 AND id = ?3",
                params![redact(error_code), tenant_id, pending_id],
            )?;
            Ok(())
        })
    }

    /// Record the collaborator reference of a confirmed action.
    pub fn complete_pending(&self, tenant_id: &str, pending_id: i64, reference: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE pending_actions SET result_redacted = ?1, last_error = NULL WHERE tenant_id = ?2 AND id = ?3",
                params![redact(reference), tenant_id, pending_id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pending::generate_confirm_token;
    use crate::domain::{RuleDocument, TaskActionConfig};
    use serde_json::json;

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let draft = RuleDocument::from_json(
            &json!({
                "name": "r",
                "triggers": [{"type": "eventlog", "config": {"allowed_event_types": ["a"]}}],
                "actions": [{"type": "create_task", "config": {"title": "t"}}]
            })
            .to_string(),
        )
        .unwrap()
        .into_draft()
        .unwrap();
        (db.clone(), db.create_rule("t1", &draft).unwrap().id)
    }

    fn new_pending(rule_id: i64) -> NewPendingAction {
        let mut snapshot = ContextSnapshot::default();
        snapshot.0.insert("event_id".to_string(), json!(3));
        snapshot.0.insert("secret_payload".to_string(), json!("leak"));
        NewPendingAction {
            tenant_id: "t1".to_string(),
            rule_id,
            action_config: ActionConfig::CreateTask(TaskActionConfig {
                title: "Call back".to_string(),
                description: None,
                due_in_days: None,
                requires_confirm: None,
            }),
            context_snapshot: snapshot,
            confirm_token: generate_confirm_token(),
        }
    }

    #[test]
    fn test_snapshot_is_restricted_on_insert() {
        let (db, rule_id) = setup();
        let pending = db.insert_pending(&new_pending(rule_id)).unwrap();
        assert!(pending.context_snapshot.0.contains_key("event_id"));
        assert!(!pending.context_snapshot.0.contains_key("secret_payload"));
    }

    #[test]
    fn test_claim_is_single_use() {
        let (db, rule_id) = setup();
        let pending = db.insert_pending(&new_pending(rule_id)).unwrap();
        assert!(db.claim_pending("t1", pending.id, Utc::now()).unwrap());
        assert!(!db.claim_pending("t1", pending.id, Utc::now()).unwrap());
    }

    #[test]
    fn test_release_allows_retry() {
        let (db, rule_id) = setup();
        let pending = db.insert_pending(&new_pending(rule_id)).unwrap();
        assert!(db.claim_pending("t1", pending.id, Utc::now()).unwrap());
        db.release_pending("t1", pending.id, "error_transient:timeout").unwrap();

        let reloaded = db.get_pending("t1", pending.id).unwrap();
        assert!(!reloaded.is_confirmed());
        assert_eq!(reloaded.last_error.as_deref(), Some("error_transient:timeout"));
        assert!(db.claim_pending("t1", pending.id, Utc::now()).unwrap());
    }

    #[test]
    fn test_cross_tenant_is_not_found() {
        let (db, rule_id) = setup();
        let pending = db.insert_pending(&new_pending(rule_id)).unwrap();
        assert_eq!(db.get_pending("t2", pending.id).unwrap_err().code(), "not_found");
        assert!(!db.claim_pending("t2", pending.id, Utc::now()).unwrap());
        assert!(db.list_pending("t2", true).unwrap().is_empty());
    }

    #[test]
    fn test_list_hides_confirmed_by_default() {
        let (db, rule_id) = setup();
        let first = db.insert_pending(&new_pending(rule_id)).unwrap();
        db.insert_pending(&new_pending(rule_id)).unwrap();
        db.claim_pending("t1", first.id, Utc::now()).unwrap();

        assert_eq!(db.list_pending("t1", false).unwrap().len(), 1);
        assert_eq!(db.list_pending("t1", true).unwrap().len(), 2);
    }
}
