//! Rule persistence: CRUD with nested children, versioning, import/export.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{encode_ts, ts_column, Database};
use crate::domain::rule::validate_tenant;
use crate::domain::{
    Action, ActionConfig, Condition, ConditionConfig, Rule, RuleDocument, RuleDraft, RulePatch, Trigger,
    TriggerConfig,
};
use crate::error::{EngineError, Result};

/// Result of importing a rule document
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    /// False when an identical rule with the same name already existed
    pub created: bool,
    pub rule: Rule,
}

const RULE_COLUMNS: &str = "id, tenant_id, name, description, is_enabled, version, max_executions_per_minute, \
                            disabled_reason, created_at, updated_at";

/// Rule row before its children are attached
struct RuleRow {
    id: i64,
    tenant_id: String,
    name: String,
    description: String,
    is_enabled: bool,
    version: i64,
    max_executions_per_minute: u32,
    disabled_reason: Option<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

fn map_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RuleRow> {
    Ok(RuleRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        is_enabled: row.get(4)?,
        version: row.get(5)?,
        max_executions_per_minute: row.get(6)?,
        disabled_reason: row.get(7)?,
        created_at: ts_column(row, 8)?,
        updated_at: ts_column(row, 9)?,
    })
}

/// Child tables share one shape
#[derive(Debug, Clone, Copy)]
enum ChildTable {
    Triggers,
    Conditions,
    Actions,
}

impl ChildTable {
    fn name(&self) -> &'static str {
        match self {
            ChildTable::Triggers => "rule_triggers",
            ChildTable::Conditions => "rule_conditions",
            ChildTable::Actions => "rule_actions",
        }
    }

    /// Disable reason for a rule whose rows in this table no longer decode
    fn invalid_reason(&self) -> &'static str {
        match self {
            ChildTable::Triggers => "trigger_invalid",
            ChildTable::Conditions => "condition_invalid",
            ChildTable::Actions => "action_invalid",
        }
    }
}

/// Child row as stored: id, kind, raw JSON config
type RawChild = (i64, String, String);

struct RawChildren {
    triggers: Vec<RawChild>,
    conditions: Vec<RawChild>,
    actions: Vec<RawChild>,
}

/// A stored child row that no longer decodes
struct UndecodableChild {
    table: ChildTable,
    error: EngineError,
}

fn load_children(conn: &Connection, table: ChildTable, rule_id: i64) -> Result<Vec<RawChild>> {
    let sql = format!(
        "SELECT id, kind, config FROM {} WHERE rule_id = ?1 ORDER BY position, id",
        table.name()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![rule_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn load_rule_children(conn: &Connection, rule_id: i64) -> Result<RawChildren> {
    Ok(RawChildren {
        triggers: load_children(conn, ChildTable::Triggers, rule_id)?,
        conditions: load_children(conn, ChildTable::Conditions, rule_id)?,
        actions: load_children(conn, ChildTable::Actions, rule_id)?,
    })
}

fn decode_children<T>(
    table: ChildTable,
    rows: Vec<RawChild>,
    decode: impl Fn(i64, &str, Value) -> Result<T>,
) -> std::result::Result<Vec<T>, UndecodableChild> {
    rows.into_iter()
        .map(|(id, kind, text)| {
            serde_json::from_str(&text)
                .map_err(|e| EngineError::Validation(format!("{} config: {}", table.name(), e)))
                .and_then(|config| decode(id, &kind, config))
        })
        .collect::<Result<Vec<_>>>()
        .map_err(|error| UndecodableChild { table, error })
}

fn assemble(row: RuleRow, children: RawChildren) -> std::result::Result<Rule, UndecodableChild> {
    let triggers = decode_children(ChildTable::Triggers, children.triggers, |id, kind, config| {
        Ok(Trigger {
            id,
            config: TriggerConfig::decode(kind, config)?,
        })
    })?;
    let conditions = decode_children(ChildTable::Conditions, children.conditions, |id, kind, config| {
        Ok(Condition {
            id,
            config: ConditionConfig::decode(kind, config)?,
        })
    })?;
    let actions = decode_children(ChildTable::Actions, children.actions, |id, kind, config| {
        Ok(Action {
            id,
            config: ActionConfig::decode(kind, config)?,
        })
    })?;

    Ok(Rule {
        id: row.id,
        tenant_id: row.tenant_id,
        name: row.name,
        description: row.description,
        is_enabled: row.is_enabled,
        version: row.version,
        max_executions_per_minute: row.max_executions_per_minute,
        disabled_reason: row.disabled_reason,
        created_at: row.created_at,
        updated_at: row.updated_at,
        triggers,
        conditions,
        actions,
    })
}

fn hydrate(conn: &Connection, row: RuleRow) -> Result<Rule> {
    let children = load_rule_children(conn, row.id)?;
    assemble(row, children).map_err(|e| e.error)
}

fn fetch_rule(conn: &Connection, tenant_id: &str, rule_id: i64) -> Result<Rule> {
    let sql = format!("SELECT {} FROM rules WHERE tenant_id = ?1 AND id = ?2", RULE_COLUMNS);
    let row = conn
        .query_row(&sql, params![tenant_id, rule_id], map_rule_row)
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("rule {}", rule_id)))?;
    hydrate(conn, row)
}

fn fetch_rule_rows(conn: &Connection, tenant_id: &str, enabled_only: bool) -> Result<Vec<RuleRow>> {
    let sql = format!(
        "SELECT {} FROM rules WHERE tenant_id = ?1 {} ORDER BY id",
        RULE_COLUMNS,
        if enabled_only { "AND is_enabled = 1" } else { "" }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![tenant_id], map_rule_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Enabled rules ready to run. A rule whose stored children no longer
/// decode is disabled in place and left out.
fn fetch_runnable_rules(conn: &Connection, tenant_id: &str) -> Result<Vec<Rule>> {
    let rows = fetch_rule_rows(conn, tenant_id, true)?;
    let mut rules = Vec::with_capacity(rows.len());

    for row in rows {
        let rule_id = row.id;
        let children = load_rule_children(conn, rule_id)?;
        match assemble(row, children) {
            Ok(rule) => rules.push(rule),
            Err(undecodable) => {
                let reason = undecodable.table.invalid_reason();
                warn!(tenant_id, rule_id, reason, error = %undecodable.error, "Stored rule no longer decodes");
                disable_rule(conn, tenant_id, rule_id, reason)?;
            }
        }
    }
    Ok(rules)
}

fn disable_rule(conn: &Connection, tenant_id: &str, rule_id: i64, reason: &str) -> Result<()> {
    conn.execute(
        "UPDATE rules SET is_enabled = 0, disabled_reason = ?1, version = version + 1, updated_at = ?2 \
         WHERE tenant_id = ?3 AND id = ?4",
        params![reason, encode_ts(&Utc::now()), tenant_id, rule_id],
    )?;
    Ok(())
}

fn name_taken(conn: &Connection, tenant_id: &str, name: &str, except_id: Option<i64>) -> Result<bool> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM rules WHERE tenant_id = ?1 AND name = ?2",
            params![tenant_id, name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(matches!(existing, Some(id) if Some(id) != except_id))
}

fn canonical(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn replace_children(
    conn: &Connection,
    table: ChildTable,
    tenant_id: &str,
    rule_id: i64,
    children: &[(String, Value)],
) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE rule_id = ?1 AND tenant_id = ?2", table.name()),
        params![rule_id, tenant_id],
    )?;
    let sql = format!(
        "INSERT INTO {} (rule_id, tenant_id, position, kind, config) VALUES (?1, ?2, ?3, ?4, ?5)",
        table.name()
    );
    let mut stmt = conn.prepare(&sql)?;
    for (position, (kind, config)) in children.iter().enumerate() {
        stmt.execute(params![rule_id, tenant_id, position as i64, kind, canonical(config)?])?;
    }
    Ok(())
}

fn trigger_rows(triggers: &[TriggerConfig]) -> Result<Vec<(String, Value)>> {
    triggers
        .iter()
        .map(|t| Ok((t.kind().as_str().to_string(), t.config_value()?)))
        .collect()
}

fn condition_rows(conditions: &[ConditionConfig]) -> Vec<(String, Value)> {
    conditions
        .iter()
        .map(|c| (c.kind().as_str().to_string(), c.config_value()))
        .collect()
}

fn action_rows(actions: &[ActionConfig]) -> Result<Vec<(String, Value)>> {
    actions
        .iter()
        .map(|a| Ok((a.kind().as_str().to_string(), a.config_value()?)))
        .collect()
}

fn insert_rule(conn: &Connection, tenant_id: &str, draft: &RuleDraft) -> Result<i64> {
    if name_taken(conn, tenant_id, &draft.name, None)? {
        return Err(EngineError::AlreadyExists(format!("rule named '{}'", draft.name)));
    }

    let now = encode_ts(&Utc::now());
    conn.execute(
        "INSERT INTO rules (tenant_id, name, description, is_enabled, version, max_executions_per_minute, \
         created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)",
        params![
            tenant_id,
            draft.name,
            draft.description,
            draft.is_enabled,
            draft.max_executions_per_minute,
            now
        ],
    )?;
    let rule_id = conn.last_insert_rowid();

    replace_children(conn, ChildTable::Triggers, tenant_id, rule_id, &trigger_rows(&draft.triggers)?)?;
    replace_children(conn, ChildTable::Conditions, tenant_id, rule_id, &condition_rows(&draft.conditions))?;
    replace_children(conn, ChildTable::Actions, tenant_id, rule_id, &action_rows(&draft.actions)?)?;
    Ok(rule_id)
}

impl Database {
    /// Create a rule with its children.
    pub fn create_rule(&self, tenant_id: &str, draft: &RuleDraft) -> Result<Rule> {
        validate_tenant(tenant_id)?;
        draft.validate()?;

        let rule = self.with_tx(|tx| {
            let rule_id = insert_rule(tx, tenant_id, draft)?;
            fetch_rule(tx, tenant_id, rule_id)
        })?;
        info!(tenant_id, rule_id = rule.id, "Rule created");
        Ok(rule)
    }

    /// Load a rule; rules of other tenants are `NotFound`.
    pub fn get_rule(&self, tenant_id: &str, rule_id: i64) -> Result<Rule> {
        validate_tenant(tenant_id)?;
        self.with_conn(|conn| fetch_rule(conn, tenant_id, rule_id))
    }

    /// All rules of a tenant in creation order
    pub fn list_rules(&self, tenant_id: &str) -> Result<Vec<Rule>> {
        validate_tenant(tenant_id)?;
        self.with_conn(|conn| {
            fetch_rule_rows(conn, tenant_id, false)?
                .into_iter()
                .map(|row| hydrate(conn, row))
                .collect()
        })
    }

    /// Enabled rules of a tenant in creation order.
    ///
    /// A rule whose stored trigger, condition or action rows no longer decode
    /// is auto-disabled (`trigger_invalid`, `condition_invalid`,
    /// `action_invalid`) and skipped, so it cannot block the others.
    pub fn list_enabled_rules(&self, tenant_id: &str) -> Result<Vec<Rule>> {
        validate_tenant(tenant_id)?;
        self.with_tx(|tx| fetch_runnable_rules(tx, tenant_id))
    }

    /// Tenants that own at least one enabled rule
    pub fn rule_tenants(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT tenant_id FROM rules WHERE is_enabled = 1 ORDER BY tenant_id",
            )?;
            let tenants = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(tenants)
        })
    }

    /// Partial update. Supplied child lists replace the stored ones; the
    /// version is bumped on every successful write.
    pub fn update_rule(&self, tenant_id: &str, rule_id: i64, patch: &RulePatch) -> Result<Rule> {
        validate_tenant(tenant_id)?;
        patch.validate()?;

        let rule = self.with_tx(|tx| {
            let current = fetch_rule(tx, tenant_id, rule_id)?;

            if let Some(name) = &patch.name {
                if name_taken(tx, tenant_id, name, Some(rule_id))? {
                    return Err(EngineError::AlreadyExists(format!("rule named '{}'", name)));
                }
            }

            let is_enabled = patch.is_enabled.unwrap_or(current.is_enabled);
            let disabled_reason = if is_enabled { None } else { current.disabled_reason.clone() };

            tx.execute(
                "UPDATE rules SET name = ?1, description = ?2, is_enabled = ?3, max_executions_per_minute = ?4, \
                 disabled_reason = ?5, version = version + 1, updated_at = ?6 WHERE tenant_id = ?7 AND id = ?8",
                params![
                    patch.name.as_ref().unwrap_or(&current.name),
                    patch.description.as_ref().unwrap_or(&current.description),
                    is_enabled,
                    patch.max_executions_per_minute.unwrap_or(current.max_executions_per_minute),
                    disabled_reason,
                    encode_ts(&Utc::now()),
                    tenant_id,
                    rule_id
                ],
            )?;

            if let Some(triggers) = &patch.triggers {
                replace_children(tx, ChildTable::Triggers, tenant_id, rule_id, &trigger_rows(triggers)?)?;
            }
            if let Some(conditions) = &patch.conditions {
                replace_children(tx, ChildTable::Conditions, tenant_id, rule_id, &condition_rows(conditions))?;
            }
            if let Some(actions) = &patch.actions {
                replace_children(tx, ChildTable::Actions, tenant_id, rule_id, &action_rows(actions)?)?;
            }

            fetch_rule(tx, tenant_id, rule_id)
        })?;
        info!(tenant_id, rule_id, version = rule.version, "Rule updated");
        Ok(rule)
    }

    /// Delete a rule; children, log rows and pending actions cascade.
    pub fn delete_rule(&self, tenant_id: &str, rule_id: i64) -> Result<()> {
        validate_tenant(tenant_id)?;
        let deleted = self.with_tx(|tx| {
            Ok(tx.execute(
                "DELETE FROM rules WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, rule_id],
            )?)
        })?;
        if deleted == 0 {
            return Err(EngineError::NotFound(format!("rule {}", rule_id)));
        }
        info!(tenant_id, rule_id, "Rule deleted");
        Ok(())
    }

    /// Enable or disable a rule. Enabling clears `disabled_reason`.
    pub fn set_rule_enabled(&self, tenant_id: &str, rule_id: i64, enabled: bool) -> Result<Rule> {
        let patch = RulePatch {
            is_enabled: Some(enabled),
            ..Default::default()
        };
        self.update_rule(tenant_id, rule_id, &patch)
    }

    /// Switch a rule off because the engine cannot evaluate it.
    pub fn auto_disable_rule(&self, tenant_id: &str, rule_id: i64, reason: &str) -> Result<()> {
        self.with_tx(|tx| disable_rule(tx, tenant_id, rule_id, reason))?;
        warn!(tenant_id, rule_id, reason, "Rule auto-disabled");
        Ok(())
    }

    /// Canonical export document of a rule
    pub fn export_rule(&self, tenant_id: &str, rule_id: i64) -> Result<RuleDocument> {
        self.get_rule(tenant_id, rule_id)?.to_document()
    }

    /// Import a canonical rule document.
    ///
    /// A same-named rule with identical canonical content is returned as is;
    /// a same-named rule with different content is `AlreadyExists`.
    pub fn import_rule(&self, tenant_id: &str, document: RuleDocument) -> Result<ImportOutcome> {
        validate_tenant(tenant_id)?;
        let draft = document.into_draft()?;
        let fingerprint = draft.to_document()?.fingerprint()?;

        let outcome = self.with_tx(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM rules WHERE tenant_id = ?1 AND name = ?2",
                    params![tenant_id, draft.name],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(rule_id) = existing {
                let rule = fetch_rule(tx, tenant_id, rule_id)?;
                if rule.fingerprint()? == fingerprint {
                    return Ok(ImportOutcome { created: false, rule });
                }
                return Err(EngineError::AlreadyExists(format!("rule named '{}'", draft.name)));
            }

            let rule_id = insert_rule(tx, tenant_id, &draft)?;
            Ok(ImportOutcome {
                created: true,
                rule: fetch_rule(tx, tenant_id, rule_id)?,
            })
        })?;
        info!(tenant_id, rule_id = outcome.rule.id, created = outcome.created, "Rule imported");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(name: &str) -> RuleDraft {
        RuleDocument::from_json(
            &json!({
                "name": name,
                "triggers": [{"type": "eventlog", "config": {"allowed_event_types": ["email.received"]}}],
                "actions": [{"type": "create_task", "config": {"title": "Reply", "requires_confirm": false}}]
            })
            .to_string(),
        )
        .unwrap()
        .into_draft()
        .unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let db = Database::open_in_memory().unwrap();
        let rule = db.create_rule("t1", &draft("Inbox")).unwrap();
        assert_eq!(rule.version, 1);
        assert!(rule.is_enabled);
        assert_eq!(rule.triggers.len(), 1);
        assert_eq!(db.get_rule("t1", rule.id).unwrap(), rule);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.create_rule("t1", &draft("Inbox")).unwrap();
        let err = db.create_rule("t1", &draft("Inbox")).unwrap_err();
        assert_eq!(err.code(), "already_exists");

        // Same name in another tenant is fine
        assert!(db.create_rule("t2", &draft("Inbox")).is_ok());
    }

    #[test]
    fn test_empty_tenant_rejected() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.create_rule(" ", &draft("x")).unwrap_err().code(), "validation_error");
    }

    #[test]
    fn test_auto_disable_and_reenable() {
        let db = Database::open_in_memory().unwrap();
        let rule = db.create_rule("t1", &draft("Inbox")).unwrap();

        db.auto_disable_rule("t1", rule.id, "condition_invalid").unwrap();
        let disabled = db.get_rule("t1", rule.id).unwrap();
        assert!(!disabled.is_enabled);
        assert_eq!(disabled.disabled_reason.as_deref(), Some("condition_invalid"));
        assert!(db.list_enabled_rules("t1").unwrap().is_empty());

        let enabled = db.set_rule_enabled("t1", rule.id, true).unwrap();
        assert!(enabled.is_enabled);
        assert!(enabled.disabled_reason.is_none());
        assert_eq!(enabled.version, disabled.version + 1);
    }

    #[test]
    fn test_undecodable_rule_is_disabled_on_load() {
        let db = Database::open_in_memory().unwrap();
        let broken = db.create_rule("t1", &draft("Broken")).unwrap();
        let healthy = db.create_rule("t1", &draft("Healthy")).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE rule_triggers SET config = 'not json' WHERE rule_id = ?1", params![broken.id])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(db.get_rule("t1", broken.id).unwrap_err().code(), "validation_error");

        let runnable = db.list_enabled_rules("t1").unwrap();
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].id, healthy.id);

        let (enabled, reason): (bool, Option<String>) = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT is_enabled, disabled_reason FROM rules WHERE id = ?1",
                    params![broken.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert!(!enabled);
        assert_eq!(reason.as_deref(), Some("trigger_invalid"));
        assert_eq!(db.list_enabled_rules("t1").unwrap().len(), 1);
    }

    #[test]
    fn test_rule_tenants() {
        let db = Database::open_in_memory().unwrap();
        db.create_rule("b", &draft("x")).unwrap();
        db.create_rule("a", &draft("x")).unwrap();
        assert_eq!(db.rule_tenants().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
