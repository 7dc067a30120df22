//! Action Policy Integration Tests
//!
//! Safety checks applied at dispatch and collaborator retry behavior.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rulekeeper::adapters::Collaborators;
use rulekeeper::domain::{ExecutionLog, ExecutionStatus};
use serde_json::{json, Value};

use common::{append, create_rule, engine_with, harness, FlakyTasks, Harness, ALLOWED_WEBHOOK_HOST};

/// Run one email.received event through a single-action rule and return its log row
async fn run_single(h: &Harness, action: Value) -> ExecutionLog {
    let rule = create_rule(
        &h.db,
        "t1",
        json!({
            "name": "policy",
            "triggers": [{"type": "eventlog", "config": {"allowed_event_types": ["email.received"]}}],
            "actions": [action]
        }),
    );
    append(&h.log, "t1", "email.received", json!({"from": "x@partner.example"}));
    h.engine.process_eventlog("t1").await.unwrap();

    let mut rows = h.db.list_executions("t1", Some(rule.id), 10).unwrap();
    assert_eq!(rows.len(), 1);
    rows.remove(0)
}

fn webhook(url: &str, extra: Value) -> Value {
    let mut config = json!({"url": url, "requires_confirm": false});
    if let (Some(config), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
        config.extend(extra.clone());
    }
    json!({"type": "webhook", "config": config})
}

fn allowed_url() -> String {
    format!("https://{}/hook", ALLOWED_WEBHOOK_HOST)
}

#[tokio::test]
async fn test_unknown_recipient_is_refused() {
    let h = harness();
    let row = run_single(
        &h,
        json!({"type": "email_draft", "config": {
            "to": ["stranger@example.org"],
            "subject": "Hello",
            "body": "Hi"
        }}),
    )
    .await;

    assert_eq!(row.status, ExecutionStatus::Failed);
    assert_eq!(row.error_redacted.as_deref(), Some("recipient_not_in_crm"));
    assert!(h.engine.list_pending("t1", true).unwrap().is_empty());
}

#[tokio::test]
async fn test_send_without_oauth_account_fails() {
    let h = harness();
    h.local.add_contact("t1", "client@example.org", "Client").unwrap();
    let row = run_single(
        &h,
        json!({"type": "email_send", "config": {
            "to": ["client@example.org"],
            "subject": "Hello",
            "body": "Hi",
            "account_id": "office"
        }}),
    )
    .await;

    assert_eq!(row.error_redacted.as_deref(), Some("oauth_account_unavailable"));
}

#[tokio::test]
async fn test_send_with_account_goes_pending() {
    let h = harness();
    h.local.add_contact("t1", "client@example.org", "Client").unwrap();
    h.local
        .add_oauth_account("t1", "office", Utc::now() + Duration::hours(1), true)
        .unwrap();
    let row = run_single(
        &h,
        json!({"type": "email_send", "config": {
            "to": ["Client@Example.org"],
            "subject": "Hello",
            "body": "Hi",
            "account_id": "office",
            "requires_confirm": false
        }}),
    )
    .await;

    assert_eq!(row.status, ExecutionStatus::Pending);
    assert_eq!(h.local.mail_count("t1").unwrap(), 0);
}

#[tokio::test]
async fn test_template_outside_allow_list_is_refused() {
    let h = harness();
    let row = run_single(
        &h,
        json!({"type": "create_task", "config": {
            "title": "Answer {subject} from {from_domain}",
            "requires_confirm": false
        }}),
    )
    .await;

    assert_eq!(row.error_redacted.as_deref(), Some("template_variables_not_allowed"));
    assert_eq!(h.local.task_count("t1").unwrap(), 0);
}

#[tokio::test]
async fn test_rendered_subject_over_limit_is_refused() {
    let h = harness();
    let row = run_single(
        &h,
        json!({"type": "create_task", "config": {
            "title": "x".repeat(201),
            "requires_confirm": false
        }}),
    )
    .await;

    assert_eq!(row.error_redacted.as_deref(), Some("subject_too_long"));
}

#[tokio::test]
async fn test_webhook_host_must_be_allowed() {
    let h = harness();
    let row = run_single(&h, webhook("https://evil.example.net/collect", json!({}))).await;

    assert_eq!(row.error_redacted.as_deref(), Some("domain_not_allowed"));
    assert!(h.webhooks.requests().is_empty());
}

#[tokio::test]
async fn test_credential_headers_are_refused() {
    let h = harness();
    let row = run_single(&h, webhook(&allowed_url(), json!({"headers": {"X-Api-Key": "abc"}}))).await;

    assert_eq!(row.error_redacted.as_deref(), Some("header_not_allowed"));
    assert!(h.webhooks.requests().is_empty());
}

#[tokio::test]
async fn test_webhook_5xx_is_retried_once() {
    let h = harness();
    h.webhooks.respond_with(&[503, 200]);
    let row = run_single(&h, webhook(&allowed_url(), json!({"headers": {"X-Source": "rules"}}))).await;

    assert_eq!(row.status, ExecutionStatus::Ok);
    assert_eq!(row.output_redacted.as_deref(), Some("webhook:ok:http_200"));

    let requests = h.webhooks.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].headers.get("X-Source").map(String::as_str), Some("rules"));
    assert_eq!(requests[0].body["event"]["from_domain"], json!("partner.example"));
    assert!(requests[0].body["event"].get("tenant_id").is_none());
}

#[tokio::test]
async fn test_webhook_5xx_twice_fails_transient() {
    let h = harness();
    h.webhooks.respond_with(&[503, 503]);
    let row = run_single(&h, webhook(&allowed_url(), json!({}))).await;

    assert_eq!(row.status, ExecutionStatus::Failed);
    assert_eq!(row.error_redacted.as_deref(), Some("webhook_transient_http_503"));
    assert_eq!(h.webhooks.requests().len(), 2);
}

#[tokio::test]
async fn test_webhook_never_gets_a_second_retry() {
    let h = harness();
    h.webhooks.respond_with(&[503, 503, 503, 200]);
    let row = run_single(&h, webhook(&allowed_url(), json!({}))).await;

    assert_eq!(row.status, ExecutionStatus::Failed);
    assert_eq!(row.error_redacted.as_deref(), Some("webhook_transient_http_503"));
    assert_eq!(h.webhooks.requests().len(), 2);
}

#[tokio::test]
async fn test_webhook_url_with_credentials_is_refused() {
    let h = harness();
    let url = format!("https://user:secret@{}/hook", ALLOWED_WEBHOOK_HOST);
    let row = run_single(&h, webhook(&url, json!({}))).await;

    assert_eq!(row.status, ExecutionStatus::Failed);
    assert_eq!(row.error_redacted.as_deref(), Some("domain_not_allowed"));
    assert!(h.webhooks.requests().is_empty());
}

#[tokio::test]
async fn test_webhook_4xx_is_not_retried() {
    let h = harness();
    h.webhooks.respond_with(&[404]);
    let row = run_single(&h, webhook(&allowed_url(), json!({}))).await;

    assert_eq!(row.error_redacted.as_deref(), Some("webhook_http_404"));
    assert_eq!(h.webhooks.requests().len(), 1);
}

#[tokio::test]
async fn test_transient_task_failure_is_retried_once() {
    let h = harness();
    let flaky = Arc::new(FlakyTasks::new(h.local.clone(), 1));
    let mut collaborators = Collaborators::local(h.local.clone(), h.webhooks.clone());
    collaborators.tasks = flaky.clone();
    let engine = engine_with(&h.db, collaborators, Arc::new(h.log.clone()));

    create_rule(
        &h.db,
        "t1",
        json!({
            "name": "flaky",
            "triggers": [{"type": "eventlog", "config": {"allowed_event_types": ["email.received"]}}],
            "actions": [{"type": "create_task", "config": {"title": "Follow up", "requires_confirm": false}}]
        }),
    );
    append(&h.log, "t1", "email.received", json!({}));

    let report = engine.process_eventlog("t1").await.unwrap();
    assert_eq!(report.tally.executed, 1);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.local.task_count("t1").unwrap(), 1);
}

#[tokio::test]
async fn test_persistent_task_failure_is_recorded() {
    let h = harness();
    let flaky = Arc::new(FlakyTasks::new(h.local.clone(), 5));
    let mut collaborators = Collaborators::local(h.local.clone(), h.webhooks.clone());
    collaborators.tasks = flaky.clone();
    let engine = engine_with(&h.db, collaborators, Arc::new(h.log.clone()));

    let rule = create_rule(
        &h.db,
        "t1",
        json!({
            "name": "flaky",
            "triggers": [{"type": "eventlog", "config": {"allowed_event_types": ["email.received"]}}],
            "actions": [{"type": "create_task", "config": {"title": "Follow up", "requires_confirm": false}}]
        }),
    );
    let event = append(&h.log, "t1", "email.received", json!({}));

    let report = engine.process_eventlog("t1").await.unwrap();
    assert!(report.ok);
    assert_eq!(report.tally.failed, 1);
    assert_eq!(report.cursor, event.id);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

    let rows = h.db.list_executions("t1", Some(rule.id), 10).unwrap();
    assert_eq!(rows[0].error_redacted.as_deref(), Some("error_transient:task_service_busy"));
}
