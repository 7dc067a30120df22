//! The execution ledger: reservation, finalization and listing.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{encode_ts, opt_ts_column, ts_column, Database};
use crate::domain::execution::redact;
use crate::domain::{ExecutionLog, ExecutionStatus, Reservation, TriggerKind};
use crate::error::Result;

/// Width of the rate window
pub const RATE_WINDOW_SECONDS: i64 = 60;

/// Everything needed to reserve one activation
#[derive(Debug, Clone)]
pub struct ReserveRequest<'a> {
    pub tenant_id: &'a str,
    pub rule_id: i64,
    pub trigger_type: TriggerKind,
    pub trigger_ref: &'a str,
    pub max_executions_per_minute: u32,
    /// The triggering event was emitted by this rule's own action
    pub self_triggered: bool,
    pub now: DateTime<Utc>,
}

fn insert_row(
    conn: &Connection,
    req: &ReserveRequest<'_>,
    status: ExecutionStatus,
    error: Option<&str>,
) -> Result<i64> {
    let now = encode_ts(&req.now);
    let finished_at = (status != ExecutionStatus::Started).then(|| now.clone());
    conn.execute(
        "INSERT INTO execution_log (tenant_id, rule_id, trigger_type, trigger_ref, status, started_at, \
         finished_at, error_redacted) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            req.tenant_id,
            req.rule_id,
            req.trigger_type.as_str(),
            req.trigger_ref,
            status.as_str(),
            now,
            finished_at,
            error
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ExecutionLog, String, String)> {
    // trigger_type and status are parsed after the row closure
    let trigger_type: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok((
        ExecutionLog {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            rule_id: row.get(2)?,
            trigger_type: TriggerKind::Eventlog,
            trigger_ref: row.get(4)?,
            status: ExecutionStatus::Started,
            started_at: ts_column(row, 6)?,
            finished_at: opt_ts_column(row, 7)?,
            error_redacted: row.get(8)?,
            output_redacted: row.get(9)?,
        },
        trigger_type,
        status,
    ))
}

fn finish_log((mut log, trigger_type, status): (ExecutionLog, String, String)) -> Result<ExecutionLog> {
    log.trigger_type = trigger_type.parse()?;
    log.status = status.parse()?;
    Ok(log)
}

impl Database {
    /// Reserve a trigger_ref for a rule in one immediate transaction.
    ///
    /// Order: duplicate check, loop guard, rate guard, `started` insert. Only
    /// one row can ever exist per (tenant, rule, trigger_ref), whatever its
    /// status.
    pub fn reserve_execution(&self, req: &ReserveRequest<'_>) -> Result<Reservation> {
        self.with_tx(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM execution_log WHERE tenant_id = ?1 AND rule_id = ?2 AND trigger_ref = ?3",
                    params![req.tenant_id, req.rule_id, req.trigger_ref],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(Reservation::Duplicate);
            }

            if req.self_triggered {
                insert_row(tx, req, ExecutionStatus::LoopDetected, Some("loop_detected"))?;
                return Ok(Reservation::LoopDetected);
            }

            let window_start = encode_ts(&(req.now - Duration::seconds(RATE_WINDOW_SECONDS)));
            let recent: i64 = tx.query_row(
                "SELECT COUNT(*) FROM execution_log WHERE tenant_id = ?1 AND rule_id = ?2 AND started_at > ?3 \
                 AND status NOT IN ('rate_limited', 'loop_detected')",
                params![req.tenant_id, req.rule_id, window_start],
                |row| row.get(0),
            )?;
            if recent >= i64::from(req.max_executions_per_minute) {
                insert_row(tx, req, ExecutionStatus::RateLimited, Some("rate_limited"))?;
                return Ok(Reservation::RateLimited);
            }

            let log_id = insert_row(tx, req, ExecutionStatus::Started, None)?;
            Ok(Reservation::Started { log_id })
        })
    }

    /// Move a `started` row to its final status with redacted summaries.
    pub fn finish_execution(
        &self,
        tenant_id: &str,
        log_id: i64,
        status: ExecutionStatus,
        error: Option<&str>,
        output: Option<&str>,
    ) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE execution_log SET status = ?1, finished_at = ?2, error_redacted = ?3, output_redacted = ?4 \
                 WHERE tenant_id = ?5 AND id = ?6",
                params![
                    status.as_str(),
                    encode_ts(&Utc::now()),
                    error.map(redact),
                    output.map(redact),
                    tenant_id,
                    log_id
                ],
            )?;
            Ok(())
        })
    }

    /// Newest-first log rows of a tenant, optionally for one rule
    pub fn list_executions(&self, tenant_id: &str, rule_id: Option<i64>, limit: usize) -> Result<Vec<ExecutionLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, rule_id, trigger_type, trigger_ref, status, started_at, finished_at, \
                 error_redacted, output_redacted FROM execution_log \
                 WHERE tenant_id = ?1 AND (?2 IS NULL OR rule_id = ?2) ORDER BY id DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![tenant_id, rule_id, limit as i64], map_log)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(finish_log).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RuleDocument;
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
        let rule = db.create_rule("t1", &draft).unwrap();
        (db, rule.id)
    }

    fn request(rule_id: i64, trigger_ref: &str, max: u32, now: DateTime<Utc>) -> ReserveRequest<'_> {
        ReserveRequest {
            tenant_id: "t1",
            rule_id,
            trigger_type: TriggerKind::Eventlog,
            trigger_ref,
            max_executions_per_minute: max,
            self_triggered: false,
            now,
        }
    }

    #[test]
    fn test_reserve_then_duplicate() {
        let (db, rule_id) = setup();
        let now = Utc::now();
        assert!(matches!(
            db.reserve_execution(&request(rule_id, "eventlog:1", 10, now)).unwrap(),
            Reservation::Started { .. }
        ));
        assert_eq!(
            db.reserve_execution(&request(rule_id, "eventlog:1", 10, now)).unwrap(),
            Reservation::Duplicate
        );
        assert_eq!(db.list_executions("t1", Some(rule_id), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_rate_window() {
        let (db, rule_id) = setup();
        let now = Utc::now();
        for i in 0..2 {
            let trigger_ref = format!("eventlog:{}", i);
            assert!(matches!(
                db.reserve_execution(&request(rule_id, &trigger_ref, 2, now)).unwrap(),
                Reservation::Started { .. }
            ));
        }
        assert_eq!(
            db.reserve_execution(&request(rule_id, "eventlog:9", 2, now)).unwrap(),
            Reservation::RateLimited
        );
        // The rate-limited row itself does not count; the window slides.
        let later = now + Duration::seconds(61);
        assert!(matches!(
            db.reserve_execution(&request(rule_id, "eventlog:10", 2, later)).unwrap(),
            Reservation::Started { .. }
        ));
    }

    #[test]
    fn test_loop_guard_records_row() {
        let (db, rule_id) = setup();
        let mut req = request(rule_id, "eventlog:5", 10, Utc::now());
        req.self_triggered = true;
        assert_eq!(db.reserve_execution(&req).unwrap(), Reservation::LoopDetected);

        let logs = db.list_executions("t1", None, 10).unwrap();
        assert_eq!(logs[0].status, ExecutionStatus::LoopDetected);
        assert!(logs[0].finished_at.is_some());
    }

    #[test]
    fn test_finish_execution() {
        let (db, rule_id) = setup();
        let log_id = match db.reserve_execution(&request(rule_id, "eventlog:1", 10, Utc::now())).unwrap() {
            Reservation::Started { log_id } => log_id,
            other => panic!("unexpected reservation: {:?}", other),
        };
        db.finish_execution("t1", log_id, ExecutionStatus::Ok, None, Some("create_task:ok:task-1"))
            .unwrap();

        let log = &db.list_executions("t1", Some(rule_id), 10).unwrap()[0];
        assert_eq!(log.status, ExecutionStatus::Ok);
        assert_eq!(log.output_redacted.as_deref(), Some("create_task:ok:task-1"));
        assert!(db.list_executions("t2", None, 10).unwrap().is_empty());
    }
}
