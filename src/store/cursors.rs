//! Per-tenant consumption cursors. A cursor never moves backwards.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{encode_ts, Database};
use crate::error::{EngineError, Result};

/// Cursor source name of the event-log processor
pub const EVENTLOG_SOURCE: &str = "eventlog";

impl Database {
    /// Last consumed position, 0 when nothing was consumed yet
    pub fn get_cursor(&self, tenant_id: &str, source: &str) -> Result<i64> {
        let position: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT position FROM state_cursors WHERE tenant_id = ?1 AND source = ?2",
                    params![tenant_id, source],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        match position {
            Some(text) => text
                .parse()
                .map_err(|_| EngineError::Database(format!("corrupt cursor for {}", source))),
            None => Ok(0),
        }
    }

    /// Move the cursor forward to `position`; lower values are ignored.
    /// Returns the stored position afterwards.
    pub fn advance_cursor(&self, tenant_id: &str, source: &str, position: i64) -> Result<i64> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO state_cursors (tenant_id, source, position, updated_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (tenant_id, source) DO UPDATE SET position = excluded.position, \
                 updated_at = excluded.updated_at \
                 WHERE CAST(state_cursors.position AS INTEGER) < CAST(excluded.position AS INTEGER)",
                params![tenant_id, source, position.to_string(), encode_ts(&Utc::now())],
            )?;
            Ok(())
        })?;
        self.get_cursor(tenant_id, source)
    }
}
