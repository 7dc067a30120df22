//! Cron Tick Integration Tests

mod common;

use chrono::{DateTime, TimeZone, Utc};
use rulekeeper::domain::ExecutionStatus;
use serde_json::{json, Value};

use common::{create_rule, harness, harness_on};

fn at(h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    // 2026-02-18 is a Wednesday
    Utc.with_ymd_and_hms(2026, 2, 18, h, mi, s).unwrap()
}

fn weekly_rule() -> Value {
    json!({
        "name": "weekly digest",
        "triggers": [{"type": "cron", "config": {"cron_expression": "30 8 * * 3"}}],
        "actions": [{"type": "create_task", "config": {"title": "Digest {minute_ref}", "requires_confirm": false}}]
    })
}

#[tokio::test]
async fn test_fires_only_in_matching_minute() {
    let h = harness();
    let rule = create_rule(&h.db, "t1", weekly_rule());

    let hit = h.engine.run_cron_tick("t1", at(8, 30, 42)).await.unwrap();
    assert!(hit.ok);
    assert_eq!(hit.minute_ref, "202602180830");
    assert_eq!(hit.tally.matched, 1);
    assert_eq!(hit.tally.executed, 1);

    let rows = h.db.list_executions("t1", Some(rule.id), 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].trigger_ref, "cron:202602180830");
    assert_eq!(rows[0].status, ExecutionStatus::Ok);

    for (hour, minute) in [(8, 31), (9, 30)] {
        let miss = h.engine.run_cron_tick("t1", at(hour, minute, 0)).await.unwrap();
        assert!(miss.ok);
        assert_eq!(miss.tally.matched, 0);
    }
    assert_eq!(h.local.task_count("t1").unwrap(), 1);
}

#[tokio::test]
async fn test_second_tick_in_same_minute_is_duplicate() {
    let h = harness();
    create_rule(&h.db, "t1", weekly_rule());

    h.engine.run_cron_tick("t1", at(8, 30, 0)).await.unwrap();
    let again = h.engine.run_cron_tick("t1", at(8, 30, 59)).await.unwrap();

    assert!(again.ok);
    assert_eq!(again.tally.matched, 1);
    assert_eq!(again.tally.duplicates, 1);
    assert_eq!(again.tally.executed, 0);
    assert_eq!(h.local.task_count("t1").unwrap(), 1);
}

#[tokio::test]
async fn test_disabled_rule_does_not_fire() {
    let h = harness();
    let rule = create_rule(&h.db, "t1", weekly_rule());
    h.db.set_rule_enabled("t1", rule.id, false).unwrap();

    let report = h.engine.run_cron_tick("t1", at(8, 30, 0)).await.unwrap();
    assert_eq!(report.tally.matched, 0);
    assert!(h.db.list_executions("t1", None, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_eventlog_only_rule_ignores_ticks() {
    let h = harness();
    create_rule(
        &h.db,
        "t1",
        json!({
            "name": "events",
            "triggers": [{"type": "eventlog", "config": {"allowed_event_types": ["email.received"]}}],
            "actions": [{"type": "create_task", "config": {"title": "x", "requires_confirm": false}}]
        }),
    );

    let report = h.engine.run_cron_tick("t1", at(8, 30, 0)).await.unwrap();
    assert!(report.ok);
    assert_eq!(report.tally.matched, 0);
}

#[tokio::test]
async fn test_unparseable_stored_expression_disables_rule() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = temp.path().join("engine.db");
    let h = harness_on(rulekeeper::store::Database::open_at(&path).unwrap());
    let rule = create_rule(&h.db, "t1", weekly_rule());

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "UPDATE rule_triggers SET config = '{\"cron_expression\": \"30 25 * * *\"}' WHERE rule_id = ?1",
        [rule.id],
    )
    .unwrap();
    drop(raw);

    let report = h.engine.run_cron_tick("t1", at(8, 30, 0)).await.unwrap();
    assert!(report.ok);
    assert_eq!(report.disabled, 1);
    assert_eq!(report.tally.matched, 0);

    let stored = h.db.get_rule("t1", rule.id).unwrap();
    assert!(!stored.is_enabled);
    assert_eq!(stored.disabled_reason.as_deref(), Some("cron_out_of_range_hour"));
}

#[tokio::test]
async fn test_scheduled_pass_covers_every_tenant() {
    let h = harness();
    create_rule(&h.db, "t1", weekly_rule());
    create_rule(&h.db, "t2", weekly_rule());

    let passes = h.engine.run_scheduled_pass(at(8, 30, 5)).await.unwrap();
    let tenants: Vec<&str> = passes.iter().map(|p| p.tenant_id.as_str()).collect();
    assert_eq!(tenants, vec!["t1", "t2"]);
    assert!(passes.iter().all(|p| p.eventlog.ok && p.cron.tally.executed == 1));
    assert_eq!(h.local.task_count("t1").unwrap(), 1);
    assert_eq!(h.local.task_count("t2").unwrap(), 1);
}
