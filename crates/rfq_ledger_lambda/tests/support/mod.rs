#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rfq_ledger_lambda::adapters::clock::SteppingClock;
use rfq_ledger_lambda::adapters::memory_store::InMemoryObjectStore;
use rfq_ledger_lambda::adapters::quota::AllowAllQuota;
use rfq_ledger_lambda::adapters::object_store::ObjectStore;
use rfq_ledger_lambda::adapters::retry::{RetryPolicy, RetryingStore};
use rfq_ledger_lambda::handlers::api::{handle_api_event, ApiContext, ApiGatewayResponse};
use rfq_ledger_lambda::handlers::catalog::CatalogPublisher;
use rfq_ledger_lambda::handlers::idempotency::IdempotencyGuard;
use rfq_ledger_lambda::handlers::ledger::{LedgerConfig, RfqLedger};
use rfq_ledger_lambda::handlers::workflows::RfqWorkflows;
use rfq_ledger_lambda::runtime::contract::UpsertManufacturerRequest;
use rfq_ledger_lambda::runtime::model::Location;
use serde_json::{json, Value};

pub const MARKER_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 14, 10, 0, 0).unwrap()
}

/// Both buckets in memory, a clock that steps 1ms per read and no backoff.
pub struct Harness {
    pub private: InMemoryObjectStore,
    pub public: InMemoryObjectStore,
    pub clock: SteppingClock,
    pub config: LedgerConfig,
    pub notifications: Mutex<Vec<Value>>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_private_store(InMemoryObjectStore::new())
    }

    /// Small listing pages force every scan through continuation tokens.
    pub fn with_private_store(private: InMemoryObjectStore) -> Self {
        Self {
            private,
            public: InMemoryObjectStore::new(),
            clock: SteppingClock::new(start_time(), chrono::Duration::milliseconds(1)),
            config: LedgerConfig {
                prefix: String::new(),
                metadata_retry: RetryPolicy::immediate(3),
            },
            notifications: Mutex::new(Vec::new()),
        }
    }

    pub fn ledger(&self) -> RfqLedger<'_> {
        RfqLedger::new(&self.private, &self.clock, &self.config)
    }

    pub fn catalog(&self) -> CatalogPublisher<'_> {
        CatalogPublisher::new(&self.public, &self.clock, "")
    }

    pub fn with_workflows<T>(&self, body: impl FnOnce(&RfqWorkflows<'_>) -> T) -> T {
        self.workflows_over(&self.private, body)
    }

    /// Same wiring with transient private-store failures retried, as deployed.
    pub fn with_retrying_workflows<T>(&self, body: impl FnOnce(&RfqWorkflows<'_>) -> T) -> T {
        let store = RetryingStore::new(&self.private, RetryPolicy::immediate(3));
        self.workflows_over(&store, body)
    }

    fn workflows_over<T>(
        &self,
        private: &dyn ObjectStore,
        body: impl FnOnce(&RfqWorkflows<'_>) -> T,
    ) -> T {
        let ledger = RfqLedger::new(private, &self.clock, &self.config);
        let catalog = self.catalog();
        let guard = IdempotencyGuard::new(private, &self.clock, "", MARKER_RETENTION);
        let notifier = |payload: &[u8]| -> Result<(), String> {
            let value = serde_json::from_slice(payload).map_err(|error| error.to_string())?;
            self.notifications
                .lock()
                .expect("poisoned mutex")
                .push(value);
            Ok(())
        };
        let workflows = RfqWorkflows::new(&ledger, &catalog, &guard, &notifier);
        body(&workflows)
    }

    pub fn call(&self, event: Value) -> ApiGatewayResponse {
        let notifier = |_: &[u8]| -> Result<(), String> { Ok(()) };
        let context = ApiContext {
            private_store: &self.private,
            public_store: &self.public,
            clock: &self.clock,
            notifier: &notifier,
            publish_queue: None,
            quota: &AllowAllQuota,
            ledger_config: &self.config,
            marker_retention: MARKER_RETENTION,
        };
        handle_api_event(event, &context)
    }

    pub fn seed_manufacturer(&self, id: &str, categories: &[&str]) {
        self.catalog()
            .put_manufacturer(manufacturer(id, categories))
            .expect("manufacturer should be written");
    }
}

pub fn manufacturer(id: &str, categories: &[&str]) -> UpsertManufacturerRequest {
    UpsertManufacturerRequest {
        id: id.to_string(),
        tenant_id: "tenant-a".to_string(),
        name: format!("Shop {id}"),
        description: None,
        location: Location::default(),
        categories: categories.iter().map(|category| category.to_string()).collect(),
        capabilities: Vec::new(),
        contact_email: Some(format!("sales+{id}@shop.example")),
    }
}

/// HTTP API (v2) proxy event with a string body.
pub fn http_event(
    method: &str,
    path: &str,
    body: Option<Value>,
    idempotency_key: Option<&str>,
) -> Value {
    let mut headers = json!({"content-type": "application/json"});
    if let Some(key) = idempotency_key {
        headers["idempotency-key"] = json!(key);
    }
    json!({
        "version": "2.0",
        "rawPath": path,
        "requestContext": {"http": {"method": method, "path": path, "sourceIp": "203.0.113.7"}},
        "headers": headers,
        "body": body.map(|value| Value::String(value.to_string())).unwrap_or(Value::Null),
    })
}

pub fn response_json(response: &ApiGatewayResponse) -> Value {
    serde_json::from_str(&response.body).expect("response body should be json")
}
