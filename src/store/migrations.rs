//! Database migrations.
//!
//! Each migration upgrades the schema by one version, tracked in
//! `PRAGMA user_version`. Migrations run when the database is opened.

use rusqlite::Connection;

use crate::error::{EngineError, Result};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

/// Get the current schema version from the database.
///
/// Returns 0 if no version has been set (new database).
pub fn get_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {};", version))?;
    Ok(())
}

/// Run all pending migrations.
pub fn run(conn: &Connection) -> Result<()> {
    let current = get_version(conn)?;

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=CURRENT_VERSION {
        run_migration(conn, version)?;
        set_version(conn, version)?;
    }

    Ok(())
}

fn run_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(EngineError::Database(format!("Unknown migration version: {}", version))),
    }
}

/// Migration v1: initial schema.
///
/// Engine tables (`rules` and children, `execution_log`, `state_cursors`,
/// `pending_actions`), the bundled `event_log`, and the `local_*` tables
/// backing the local collaborators.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            is_enabled INTEGER NOT NULL DEFAULT 1,
            version INTEGER NOT NULL DEFAULT 1,
            max_executions_per_minute INTEGER NOT NULL DEFAULT 10,
            disabled_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (tenant_id, name)
        );

        CREATE TABLE IF NOT EXISTS rule_triggers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
            tenant_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            kind TEXT NOT NULL,
            config TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rule_conditions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
            tenant_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            kind TEXT NOT NULL,
            config TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rule_actions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
            tenant_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            kind TEXT NOT NULL,
            config TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_rule_triggers_rule ON rule_triggers(rule_id, position);
        CREATE INDEX IF NOT EXISTS idx_rule_conditions_rule ON rule_conditions(rule_id, position);
        CREATE INDEX IF NOT EXISTS idx_rule_actions_rule ON rule_actions(rule_id, position);

        CREATE TABLE IF NOT EXISTS execution_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
            trigger_type TEXT NOT NULL,
            trigger_ref TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            error_redacted TEXT,
            output_redacted TEXT,
            UNIQUE (tenant_id, rule_id, trigger_ref)
        );

        CREATE INDEX IF NOT EXISTS idx_execution_log_window
            ON execution_log(tenant_id, rule_id, started_at);

        CREATE TABLE IF NOT EXISTS state_cursors (
            tenant_id TEXT NOT NULL,
            source TEXT NOT NULL,
            position TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, source)
        );

        CREATE TABLE IF NOT EXISTS pending_actions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
            action_type TEXT NOT NULL,
            action_config TEXT NOT NULL,
            context_snapshot TEXT NOT NULL,
            confirm_token TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            confirmed_at TEXT,
            last_error TEXT,
            result_redacted TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_pending_actions_tenant
            ON pending_actions(tenant_id, confirmed_at);

        CREATE TABLE IF NOT EXISTS event_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            ts TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            payload TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_event_log_tenant ON event_log(tenant_id, id);

        CREATE TABLE IF NOT EXISTS local_contacts (
            tenant_id TEXT NOT NULL,
            email TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (tenant_id, email)
        );

        CREATE TABLE IF NOT EXISTS local_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            rule_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            due_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS local_postfach (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            rule_id INTEGER NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS local_mail (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            rule_id INTEGER NOT NULL,
            account_id TEXT,
            recipients TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS local_oauth_accounts (
            tenant_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            refreshable INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (tenant_id, account_id)
        );
        ",
    )?;
    Ok(())
}
