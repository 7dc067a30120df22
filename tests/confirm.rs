//! Two-Phase Confirmation Integration Tests

mod common;

use rulekeeper::core::ConfirmRequest;
use rulekeeper::domain::PendingAction;
use serde_json::json;

use common::{append, create_rule, harness, Harness, ALLOWED_WEBHOOK_HOST};

async fn propose_postfach(h: &Harness, tenant_id: &str) -> PendingAction {
    create_rule(
        &h.db,
        tenant_id,
        json!({
            "name": "inbox note",
            "triggers": [{"type": "eventlog", "config": {"allowed_event_types": ["email.received"]}}],
            "actions": [{"type": "create_postfach_draft", "config": {
                "subject": "Mail from {from_domain}",
                "body": "Event {event_id} needs a look",
                "requires_confirm": false
            }}]
        }),
    );
    append(&h.log, tenant_id, "email.received", json!({"from": "a@client.example"}));
    let report = h.engine.process_eventlog(tenant_id).await.unwrap();
    assert_eq!(report.tally.pending, 1);

    let mut pending = h.engine.list_pending(tenant_id, false).unwrap();
    assert_eq!(pending.len(), 1);
    pending.remove(0)
}

fn request(pending: &PendingAction, token: &str, ack: bool) -> ConfirmRequest {
    ConfirmRequest {
        pending_id: pending.id,
        token: token.to_string(),
        ack,
    }
}

#[tokio::test]
async fn test_confirm_requires_acknowledgement() {
    let h = harness();
    let pending = propose_postfach(&h, "t1").await;

    let err = h
        .engine
        .confirm("t1", &request(&pending, &pending.confirm_token, false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ack_required");
    assert!(!h.engine.get_pending("t1", pending.id).unwrap().is_confirmed());
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let h = harness();
    let pending = propose_postfach(&h, "t1").await;

    let err = h
        .engine
        .confirm("t1", &request(&pending, "not-the-token", true))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "confirm_token_mismatch");
    assert!(!h.engine.get_pending("t1", pending.id).unwrap().is_confirmed());
}

#[tokio::test]
async fn test_confirm_performs_effect_exactly_once() {
    let h = harness();
    let pending = propose_postfach(&h, "t1").await;
    let confirm = request(&pending, &pending.confirm_token, true);

    let result = h.engine.confirm("t1", &confirm).await.unwrap();
    assert!(result.ok);
    assert_eq!(result.pending_id, pending.id);
    let reference = result.reference.unwrap();
    assert!(reference.starts_with("postfach-"));

    let stored = h.engine.get_pending("t1", pending.id).unwrap();
    assert!(stored.is_confirmed());
    assert_eq!(stored.result_redacted.as_deref(), Some(reference.as_str()));
    assert!(h.engine.list_pending("t1", false).unwrap().is_empty());
    assert_eq!(h.engine.list_pending("t1", true).unwrap().len(), 1);

    let err = h.engine.confirm("t1", &confirm).await.unwrap_err();
    assert_eq!(err.code(), "already_confirmed");
}

#[tokio::test]
async fn test_other_tenant_cannot_see_or_confirm() {
    let h = harness();
    let pending = propose_postfach(&h, "t1").await;

    assert_eq!(h.engine.get_pending("t2", pending.id).unwrap_err().code(), "not_found");
    assert!(h.engine.list_pending("t2", true).unwrap().is_empty());

    let err = h
        .engine
        .confirm("t2", &request(&pending, &pending.confirm_token, true))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
    assert!(!h.engine.get_pending("t1", pending.id).unwrap().is_confirmed());
}

#[tokio::test]
async fn test_failed_effect_releases_claim_for_retry() {
    let h = harness();
    create_rule(
        &h.db,
        "t1",
        json!({
            "name": "notify",
            "triggers": [{"type": "eventlog", "config": {"allowed_event_types": ["invoice.paid"]}}],
            "actions": [{"type": "webhook", "config": {
                "url": format!("https://{}/paid", ALLOWED_WEBHOOK_HOST),
                "fields": {"kind": "{event_type}"}
            }}]
        }),
    );
    append(&h.log, "t1", "invoice.paid", json!({}));
    h.engine.process_eventlog("t1").await.unwrap();
    let pending = h.engine.list_pending("t1", false).unwrap().remove(0);
    let confirm = request(&pending, &pending.confirm_token, true);

    h.webhooks.respond_with(&[404]);
    let failed = h.engine.confirm("t1", &confirm).await.unwrap();
    assert!(!failed.ok);
    assert_eq!(failed.error.as_deref(), Some("webhook_http_404"));

    let stored = h.engine.get_pending("t1", pending.id).unwrap();
    assert!(!stored.is_confirmed());
    assert_eq!(stored.last_error.as_deref(), Some("webhook_http_404"));

    let retried = h.engine.confirm("t1", &confirm).await.unwrap();
    assert!(retried.ok);
    assert_eq!(retried.reference.as_deref(), Some("http_200"));

    let stored = h.engine.get_pending("t1", pending.id).unwrap();
    assert!(stored.is_confirmed());
    assert!(stored.last_error.is_none());

    let requests = h.webhooks.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].body["fields"]["kind"], json!("invoice.paid"));
    assert_eq!(requests[1].body["trigger_ref"], json!(pending.context_snapshot.trigger_ref()));
}

#[tokio::test]
async fn test_confirmed_mail_draft_is_stored() {
    let h = harness();
    h.local.add_contact("t1", "client@example.org", "Client").unwrap();
    create_rule(
        &h.db,
        "t1",
        json!({
            "name": "draft reply",
            "triggers": [{"type": "eventlog", "config": {"allowed_event_types": ["email.received"]}}],
            "actions": [{"type": "email_draft", "config": {
                "to": ["client@example.org"],
                "subject": "Re: your mail",
                "body": "Thanks, we got it."
            }}]
        }),
    );
    append(&h.log, "t1", "email.received", json!({}));
    h.engine.process_eventlog("t1").await.unwrap();
    let pending = h.engine.list_pending("t1", false).unwrap().remove(0);

    let result = h
        .engine
        .confirm("t1", &request(&pending, &pending.confirm_token, true))
        .await
        .unwrap();
    assert!(result.ok);
    assert_eq!(h.local.mail_count("t1").unwrap(), 1);
}
