//! Queue- or invoke-driven catalog rebuilds and index reconciliation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::adapters::notifier::EventNotifier;
use crate::handlers::catalog::CatalogPublisher;
use crate::handlers::ledger::RfqLedger;
use crate::runtime::contract::{PublishRequest, ReconcileResponse};
use crate::runtime::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishSummary {
    pub rebuilt_slices: Vec<String>,
    pub reconciled: Vec<ReconcileResponse>,
}

pub fn handle_publish_request(
    request: &PublishRequest,
    catalog: &CatalogPublisher<'_>,
    ledger: &RfqLedger<'_>,
) -> LedgerResult<PublishSummary> {
    let rebuilt = catalog.rebuild(&request.manufacturer_ids)?;

    let mut reconciled = Vec::with_capacity(request.reconcile_rfq_ids.len());
    for rfq_id in &request.reconcile_rfq_ids {
        match ledger.reconcile(rfq_id) {
            Ok(response) => reconciled.push(response),
            Err(LedgerError::NotFound(_)) => {
                warn!(rfq_id = %rfq_id, "skipping reconcile for unknown rfq");
            }
            Err(error) => return Err(error),
        }
    }

    let summary = PublishSummary {
        rebuilt_slices: rebuilt.iter().map(|key| key.label()).collect(),
        reconciled,
    };
    info!(
        rebuilt = summary.rebuilt_slices.len(),
        reconciled = summary.reconciled.len(),
        "publish request handled"
    );
    Ok(summary)
}

/// Folds a batch into one request so every slice is rebuilt once per batch.
pub fn merge_publish_requests(requests: Vec<PublishRequest>) -> PublishRequest {
    let mut merged = PublishRequest::default();
    for request in requests {
        merged.manufacturer_ids.extend(request.manufacturer_ids);
        merged.reconcile_rfq_ids.extend(request.reconcile_rfq_ids);
    }
    merged.manufacturer_ids.sort();
    merged.manufacturer_ids.dedup();
    merged.reconcile_rfq_ids.sort();
    merged.reconcile_rfq_ids.dedup();
    merged
}

pub fn is_sqs_event(event: &Value) -> bool {
    event
        .get("Records")
        .and_then(Value::as_array)
        .map(|records| {
            !records.is_empty()
                && records.iter().all(|record| {
                    record
                        .get("eventSource")
                        .and_then(Value::as_str)
                        .map(|source| source == "aws:sqs")
                        .unwrap_or(false)
                })
        })
        .unwrap_or(false)
}

/// Accepts a direct invoke payload or an SQS batch whose record bodies are
/// publish requests.
pub fn decode_publish_requests(event: Value) -> Result<Vec<PublishRequest>, String> {
    if !is_sqs_event(&event) {
        return serde_json::from_value(event)
            .map(|request| vec![request])
            .map_err(|error| format!("invalid publish request: {error}"));
    }

    let records = event
        .get("Records")
        .and_then(Value::as_array)
        .ok_or_else(|| "SQS event must include Records array".to_string())?;
    let mut requests = Vec::with_capacity(records.len());
    for record in records {
        let body = record
            .get("body")
            .and_then(Value::as_str)
            .ok_or_else(|| "SQS record body must be a string".to_string())?;
        let request: PublishRequest = serde_json::from_str(body)
            .map_err(|error| format!("invalid publish request: {error}"))?;
        requests.push(request);
    }
    Ok(requests)
}

/// Queues a follow-up rebuild. A second pass converges slices written by
/// two rebuilds that scanned manufacturers concurrently.
pub fn schedule_republish(queue: &dyn EventNotifier, manufacturer_id: &str) {
    let request = PublishRequest {
        manufacturer_ids: vec![manufacturer_id.to_string()],
        reconcile_rfq_ids: Vec::new(),
    };
    let result = serde_json::to_vec(&request)
        .map_err(|error| error.to_string())
        .and_then(|payload| queue.notify(&payload));
    if let Err(error) = result {
        warn!(manufacturer_id, error = %error, "failed to queue follow-up publish");
    }
}
