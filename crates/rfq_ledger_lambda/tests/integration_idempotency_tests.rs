mod support;

use rfq_ledger_lambda::adapters::memory_store::StoreOperation;
use rfq_ledger_lambda::adapters::object_store::StoreError;
use rfq_ledger_lambda::runtime::contract::{ContactInput, CreateRfqRequest, PostMessageRequest};
use rfq_ledger_lambda::runtime::error::LedgerError;
use rfq_ledger_lambda::runtime::model::EventAuthor;
use serde_json::json;
use support::{http_event, response_json, Harness};

fn create_request(body: &str) -> CreateRfqRequest {
    CreateRfqRequest {
        tenant_id: None,
        manufacturer_id: "mfg_123".to_string(),
        buyer: ContactInput {
            email: "a@b.com".to_string(),
            name: None,
        },
        subject: "CNC prototype".to_string(),
        body: body.to_string(),
        attachments: Vec::new(),
    }
}

fn meta_count(harness: &Harness) -> usize {
    harness
        .private
        .keys_with_prefix("rfq/")
        .iter()
        .filter(|key| key.ends_with("/meta.json"))
        .count()
}

#[test]
fn same_key_and_body_yields_one_rfq() {
    let harness = Harness::new();
    harness.seed_manufacturer("mfg_123", &["cnc"]);

    let first = harness
        .with_workflows(|workflows| {
            workflows.create_rfq(create_request("2 parts, 6061"), Some("create-1"))
        })
        .expect("first create should succeed");
    let second = harness
        .with_workflows(|workflows| {
            workflows.create_rfq(create_request("2 parts, 6061"), Some("create-1"))
        })
        .expect("retry should succeed");

    assert!(second.is_replay());
    let first = first.into_inner();
    assert_eq!(first, second.into_inner());
    assert_eq!(meta_count(&harness), 1);
    assert_eq!(
        harness
            .ledger()
            .load_all_events(&first.id)
            .expect("events should load")
            .len(),
        2
    );
    assert_eq!(
        harness.notifications.lock().expect("poisoned mutex").len(),
        1
    );
}

#[test]
fn same_key_with_different_body_conflicts() {
    let harness = Harness::new();
    harness.seed_manufacturer("mfg_123", &["cnc"]);

    harness
        .with_workflows(|workflows| {
            workflows.create_rfq(create_request("2 parts, 6061"), Some("create-1"))
        })
        .expect("first create should succeed");
    let error = harness
        .with_workflows(|workflows| {
            workflows.create_rfq(create_request("3 parts, 7075"), Some("create-1"))
        })
        .expect_err("different body must conflict");

    assert_eq!(error, LedgerError::IdempotencyConflict);
    assert_eq!(error.http_status(), 409);
    assert_eq!(meta_count(&harness), 1);
}

#[test]
fn keys_are_scoped_per_operation_and_rfq() {
    let harness = Harness::new();
    harness.seed_manufacturer("mfg_123", &["cnc"]);
    let created = harness
        .with_workflows(|workflows| {
            workflows.create_rfq(create_request("2 parts"), Some("shared-key"))
        })
        .expect("create should succeed")
        .into_inner();

    let posted = harness
        .with_workflows(|workflows| {
            workflows.post_message(
                &created.id,
                PostMessageRequest {
                    by: EventAuthor::Manufacturer,
                    body: "Can quote by Friday".to_string(),
                    attachments: Vec::new(),
                },
                Some("shared-key"),
            )
        })
        .expect("message should post under its own scope");
    assert!(!posted.is_replay());
}

#[test]
fn failed_effect_releases_the_key_for_a_retry() {
    let harness = Harness::new();
    harness.seed_manufacturer("mfg_123", &["cnc"]);
    harness.private.fail_next(
        StoreOperation::Put,
        "/events/",
        StoreError::Fatal("write rejected".to_string()),
        1,
    );

    let error = harness
        .with_workflows(|workflows| {
            workflows.create_rfq(create_request("2 parts"), Some("create-9"))
        })
        .expect_err("first attempt should fail");
    assert_eq!(error.http_status(), 500);
    assert!(harness.private.keys_with_prefix("idem/").is_empty());

    let retried = harness
        .with_workflows(|workflows| {
            workflows.create_rfq(create_request("2 parts"), Some("create-9"))
        })
        .expect("retry should run the effect again");
    assert!(!retried.is_replay());
}

#[test]
fn lost_marker_response_still_creates_exactly_one_rfq() {
    let harness = Harness::new();
    harness.seed_manufacturer("mfg_123", &["cnc"]);
    harness.private.lose_next_response(StoreOperation::Put, "idem/", 1);

    let first = harness
        .with_retrying_workflows(|workflows| {
            workflows.create_rfq(create_request("2 parts"), Some("create-lost"))
        })
        .expect("claim that landed should count as acquired");
    assert!(!first.is_replay());

    let retried = harness
        .with_retrying_workflows(|workflows| {
            workflows.create_rfq(create_request("2 parts"), Some("create-lost"))
        })
        .expect("retry should replay");
    assert!(retried.is_replay());
    assert_eq!(first.into_inner(), retried.into_inner());
    assert_eq!(meta_count(&harness), 1);
}

#[test]
fn api_replay_is_flagged_and_returns_the_same_id() {
    let harness = Harness::new();
    harness.seed_manufacturer("mfg_123", &["cnc"]);
    let body = json!({
        "manufacturer_id": "mfg_123",
        "buyer": {"email": "a@b.com"},
        "subject": "CNC prototype",
        "body": "2 parts, 6061"
    });

    let first = harness.call(http_event("POST", "/rfqs", Some(body.clone()), Some("api-1")));
    let second = harness.call(http_event("POST", "/rfqs", Some(body), Some("api-1")));

    assert_eq!(first.status_code, 201);
    assert_eq!(second.status_code, 201);
    assert_eq!(response_json(&first)["id"], response_json(&second)["id"]);
    assert!(first.headers.get("Idempotent-Replayed").is_none());
    assert_eq!(second.headers["Idempotent-Replayed"], "true");
}
