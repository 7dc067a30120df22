//! The event feed the processor consumes.
//!
//! The engine reads through [`EventSource`]. [`SqliteEventLog`] is the
//! bundled implementation over the engine database; producers append to it.

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, OptionalExtension};

use super::{encode_ts, json_column, ts_column, Database};
use crate::domain::LogEvent;
use crate::error::Result;

/// Read access to an ordered, append-only event feed
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events of a tenant with id greater than `after`, ascending
    async fn fetch_after(&self, tenant_id: &str, after: i64, limit: usize) -> Result<Vec<LogEvent>>;

    /// One event of a tenant
    async fn get(&self, tenant_id: &str, event_id: i64) -> Result<Option<LogEvent>>;

    /// Most recent event of a tenant with one of the given types
    async fn latest_of_types(&self, tenant_id: &str, event_types: &[String]) -> Result<Option<LogEvent>>;
}

const EVENT_COLUMNS: &str = "id, tenant_id, ts, event_type, entity_type, entity_id, payload";

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEvent> {
    Ok(LogEvent {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        timestamp: ts_column(row, 2)?,
        event_type: row.get(3)?,
        entity_type: row.get(4)?,
        entity_id: row.get(5)?,
        payload: json_column(row, 6)?,
    })
}

impl Database {
    /// Append an event; the stored copy carries the assigned id.
    pub fn append_event(&self, event: &LogEvent) -> Result<LogEvent> {
        let timestamp = event.timestamp;
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO event_log (tenant_id, ts, event_type, entity_type, entity_id, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.tenant_id,
                    encode_ts(&timestamp),
                    event.event_type,
                    event.entity_type,
                    event.entity_id,
                    serde_json::to_string(&event.payload)?
                ],
            )?;
            Ok(LogEvent {
                id: tx.last_insert_rowid(),
                timestamp,
                ..event.clone()
            })
        })
    }
}

/// SQLite-backed event log
#[derive(Clone)]
pub struct SqliteEventLog {
    db: Database,
}

impl SqliteEventLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event for a producer
    pub fn append(&self, event: &LogEvent) -> Result<LogEvent> {
        self.db.append_event(event)
    }
}

#[async_trait]
impl EventSource for SqliteEventLog {
    async fn fetch_after(&self, tenant_id: &str, after: i64, limit: usize) -> Result<Vec<LogEvent>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM event_log WHERE tenant_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
                EVENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let events = stmt
                .query_map(params![tenant_id, after, limit as i64], map_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
    }

    async fn get(&self, tenant_id: &str, event_id: i64) -> Result<Option<LogEvent>> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {} FROM event_log WHERE tenant_id = ?1 AND id = ?2", EVENT_COLUMNS);
            Ok(conn.query_row(&sql, params![tenant_id, event_id], map_event).optional()?)
        })
    }

    async fn latest_of_types(&self, tenant_id: &str, event_types: &[String]) -> Result<Option<LogEvent>> {
        if event_types.is_empty() {
            return Ok(None);
        }
        self.db.with_conn(|conn| {
            let placeholders = vec!["?"; event_types.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM event_log WHERE tenant_id = ? AND event_type IN ({}) ORDER BY id DESC LIMIT 1",
                EVENT_COLUMNS, placeholders
            );
            let values = std::iter::once(tenant_id.to_string()).chain(event_types.iter().cloned());
            Ok(conn.query_row(&sql, params_from_iter(values), map_event).optional()?)
        })
    }
}
