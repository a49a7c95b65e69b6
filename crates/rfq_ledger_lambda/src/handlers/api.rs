use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::adapters::clock::Clock;
use crate::adapters::notifier::EventNotifier;
use crate::adapters::object_store::ObjectStore;
use crate::adapters::quota::{QuotaGate, QuotaScope};
use crate::handlers::catalog::CatalogPublisher;
use crate::handlers::idempotency::{GuardOutcome, IdempotencyGuard};
use crate::handlers::ledger::{LedgerConfig, RfqLedger};
use crate::handlers::publisher::schedule_republish;
use crate::handlers::workflows::RfqWorkflows;
use crate::runtime::contract::{
    CreateRfqRequest, ErrorEnvelope, EventsPageResponse, PostMessageRequest, PostStatusRequest,
    UpsertManufacturerRequest,
};
use crate::runtime::error::{LedgerError, LedgerResult};
use crate::runtime::pagination::{parse_limit, parse_since};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "Idempotent-Replayed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiGatewayResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: Value,
    pub body: String,
}

/// Ports the API handler runs against. Built once per cold start.
pub struct ApiContext<'a> {
    pub private_store: &'a dyn ObjectStore,
    pub public_store: &'a dyn ObjectStore,
    pub clock: &'a dyn Clock,
    pub notifier: &'a dyn EventNotifier,
    /// Follow-up rebuilds after manufacturer writes, when a queue is wired.
    pub publish_queue: Option<&'a dyn EventNotifier>,
    pub quota: &'a dyn QuotaGate,
    pub ledger_config: &'a LedgerConfig,
    pub marker_retention: Duration,
}

/// Proxy event reduced to what routing needs. Header names are lowercased.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub source_ip: Option<String>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'p> {
    CreateRfq,
    GetRfq(&'p str),
    ListEvents(&'p str),
    PostMessage(&'p str),
    PostStatus(&'p str),
    Reconcile(&'p str),
    PutManufacturer,
    DeleteManufacturer(&'p str),
}

impl Route<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::CreateRfq => "POST /rfqs",
            Self::GetRfq(_) => "GET /rfqs/{id}",
            Self::ListEvents(_) => "GET /rfqs/{id}/events",
            Self::PostMessage(_) => "POST /rfqs/{id}/messages",
            Self::PostStatus(_) => "POST /rfqs/{id}/status",
            Self::Reconcile(_) => "POST /rfqs/{id}/reconcile",
            Self::PutManufacturer => "POST /manufacturers",
            Self::DeleteManufacturer(_) => "DELETE /manufacturers/{id}",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RouteMiss {
    NotFound,
    MethodNotAllowed(&'static [&'static str]),
}

fn resolve_route<'p>(method: &str, path: &'p str) -> Result<Route<'p>, RouteMiss> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let (allowed, route): (&'static [&'static str], Route<'p>) = match segments[..] {
        ["rfqs"] => (&["POST"], Route::CreateRfq),
        ["rfqs", id] => (&["GET"], Route::GetRfq(id)),
        ["rfqs", id, "events"] => (&["GET"], Route::ListEvents(id)),
        ["rfqs", id, "messages"] => (&["POST"], Route::PostMessage(id)),
        ["rfqs", id, "status"] => (&["POST"], Route::PostStatus(id)),
        ["rfqs", id, "reconcile"] => (&["POST"], Route::Reconcile(id)),
        ["manufacturers"] => (&["POST"], Route::PutManufacturer),
        ["manufacturers", id] => (&["DELETE"], Route::DeleteManufacturer(id)),
        _ => return Err(RouteMiss::NotFound),
    };
    if allowed.iter().any(|candidate| *candidate == method) {
        Ok(route)
    } else {
        Err(RouteMiss::MethodNotAllowed(allowed))
    }
}

pub fn handle_api_event(event: Value, context: &ApiContext<'_>) -> ApiGatewayResponse {
    let request = match normalize_apigw_event(event) {
        Ok(value) => value,
        Err(message) => return error_response(&LedgerError::Validation(message)),
    };

    let route = match resolve_route(&request.method, &request.path) {
        Ok(route) => route,
        Err(RouteMiss::NotFound) => {
            let message = format!("no route for {}", request.path);
            return envelope_response(404, "not_found", message, None);
        }
        Err(RouteMiss::MethodNotAllowed(allowed)) => {
            let mut response = envelope_response(
                405,
                "method_not_allowed",
                format!("{} is not allowed on {}", request.method, request.path),
                Some(json!({ "allowed": allowed })),
            );
            set_header(&mut response, "Allow", &allowed.join(", "));
            return response;
        }
    };

    let scope = QuotaScope {
        route: route.name(),
        client: request.source_ip.as_deref(),
    };
    if let Err(reason) = context.quota.check(&scope) {
        warn!(
            route = route.name(),
            client = ?scope.client,
            reason = %reason,
            "request rate limited"
        );
        return error_response(&LedgerError::RateLimited(reason));
    }

    let prefix = context.ledger_config.prefix.as_str();
    let ledger = RfqLedger::new(context.private_store, context.clock, context.ledger_config);
    let catalog = CatalogPublisher::new(context.public_store, context.clock, prefix);
    let guard = IdempotencyGuard::new(
        context.private_store,
        context.clock,
        prefix,
        context.marker_retention,
    );
    let workflows = RfqWorkflows::new(&ledger, &catalog, &guard, context.notifier);
    let idempotency_key = request.header(IDEMPOTENCY_KEY_HEADER);

    let result = match route {
        Route::CreateRfq => parse_body::<CreateRfqRequest>(&request)
            .and_then(|body| workflows.create_rfq(body, idempotency_key))
            .and_then(|outcome| guarded_response(201, outcome)),
        Route::GetRfq(rfq_id) => ledger
            .get_rfq(rfq_id)
            .and_then(|meta| success_response(200, &meta)),
        Route::ListEvents(rfq_id) => list_events(&ledger, rfq_id, &request),
        Route::PostMessage(rfq_id) => parse_body::<PostMessageRequest>(&request)
            .and_then(|body| workflows.post_message(rfq_id, body, idempotency_key))
            .and_then(|outcome| guarded_response(201, outcome)),
        Route::PostStatus(rfq_id) => parse_body::<PostStatusRequest>(&request)
            .and_then(|body| workflows.post_status(rfq_id, body, idempotency_key))
            .and_then(|outcome| guarded_response(201, outcome)),
        Route::Reconcile(rfq_id) => ledger
            .reconcile(rfq_id)
            .and_then(|reconciled| success_response(200, &reconciled)),
        Route::PutManufacturer => parse_body::<UpsertManufacturerRequest>(&request)
            .and_then(|body| catalog.put_manufacturer(body))
            .and_then(|written| {
                republish(context, &written.id);
                success_response(200, &written)
            }),
        Route::DeleteManufacturer(manufacturer_id) => catalog
            .delete_manufacturer(manufacturer_id)
            .and_then(|deleted| {
                republish(context, &deleted.id);
                success_response(200, &deleted)
            }),
    };

    match result {
        Ok(response) => {
            info!(
                route = route.name(),
                status = response.status_code,
                "request handled"
            );
            response
        }
        Err(error) => error_response(&error),
    }
}

fn republish(context: &ApiContext<'_>, manufacturer_id: &str) {
    if let Some(queue) = context.publish_queue {
        schedule_republish(queue, manufacturer_id);
    }
}

fn list_events(
    ledger: &RfqLedger<'_>,
    rfq_id: &str,
    request: &HttpRequest,
) -> LedgerResult<ApiGatewayResponse> {
    let since = parse_since(request.query_param("since"))?;
    let limit = parse_limit(request.query_param("limit"))?;
    let page = ledger.list_events(rfq_id, since, limit)?;
    success_response(
        200,
        &EventsPageResponse {
            items: page.items,
            next_since: page.next_since,
        },
    )
}

pub fn normalize_apigw_event(event: Value) -> Result<HttpRequest, String> {
    let Some(object) = event.as_object() else {
        return Err("Request payload must be a JSON object".to_string());
    };
    let request_context = object.get("requestContext");
    let http_context = request_context.and_then(|context| context.get("http"));

    let method = http_context
        .and_then(|http| http.get("method"))
        .or_else(|| object.get("httpMethod"))
        .and_then(Value::as_str)
        .map(str::to_ascii_uppercase)
        .ok_or_else(|| "Request is missing an HTTP method".to_string())?;
    let path = object
        .get("rawPath")
        .or_else(|| http_context.and_then(|http| http.get("path")))
        .or_else(|| object.get("path"))
        .and_then(Value::as_str)
        .ok_or_else(|| "Request is missing a path".to_string())?
        .to_string();
    let source_ip = http_context
        .and_then(|http| http.get("sourceIp"))
        .or_else(|| {
            request_context
                .and_then(|context| context.get("identity"))
                .and_then(|identity| identity.get("sourceIp"))
        })
        .and_then(Value::as_str)
        .map(str::to_string);

    if object.get("isBase64Encoded").and_then(Value::as_bool) == Some(true) {
        return Err("Base64-encoded bodies are not supported".to_string());
    }
    let body = match object.get("body") {
        None | Some(Value::Null) => Value::Null,
        Some(Value::String(text)) if text.trim().is_empty() => Value::Null,
        Some(Value::String(text)) => {
            serde_json::from_str(text).map_err(|error| format!("Malformed JSON body: {error}"))?
        }
        Some(body @ Value::Object(_)) => body.clone(),
        Some(_) => return Err("Request body must be a JSON object".to_string()),
    };

    Ok(HttpRequest {
        method,
        path,
        query: string_map(object.get("queryStringParameters"), false),
        headers: string_map(object.get("headers"), true),
        body,
        source_ip,
    })
}

fn string_map(value: Option<&Value>, lowercase_keys: bool) -> BTreeMap<String, String> {
    let Some(Value::Object(entries)) = value else {
        return BTreeMap::new();
    };
    entries
        .iter()
        .filter_map(|(name, value)| {
            let value = value.as_str()?.to_string();
            let name = if lowercase_keys {
                name.to_ascii_lowercase()
            } else {
                name.clone()
            };
            Some((name, value))
        })
        .collect()
}

fn parse_body<T: DeserializeOwned>(request: &HttpRequest) -> LedgerResult<T> {
    if request.body.is_null() {
        return Err(LedgerError::Validation("Request body is required".to_string()));
    }
    serde_json::from_value(request.body.clone())
        .map_err(|error| LedgerError::Validation(format!("Malformed request: {error}")))
}

fn guarded_response<T: Serialize>(
    status_code: u16,
    outcome: GuardOutcome<T>,
) -> LedgerResult<ApiGatewayResponse> {
    let replayed = outcome.is_replay();
    let mut response = success_response(status_code, &outcome.into_inner())?;
    if replayed {
        set_header(&mut response, REPLAYED_HEADER, "true");
    }
    Ok(response)
}

fn success_response(
    status_code: u16,
    payload: &impl Serialize,
) -> LedgerResult<ApiGatewayResponse> {
    Ok(ApiGatewayResponse {
        status_code,
        headers: json!({"Content-Type": "application/json"}),
        body: serde_json::to_string(payload)?,
    })
}

fn error_response(error: &LedgerError) -> ApiGatewayResponse {
    let status_code = error.http_status();
    if !error.is_client_error() {
        error!(code = error.code(), status = status_code, error = %error, "request failed");
        return envelope_response(
            status_code,
            error.code(),
            "The request could not be completed".to_string(),
            None,
        );
    }

    let message = match error {
        LedgerError::Validation(message) | LedgerError::RateLimited(message) => message.clone(),
        other => other.to_string(),
    };
    envelope_response(status_code, error.code(), message, None)
}

fn envelope_response(
    status_code: u16,
    code: &str,
    message: String,
    details: Option<Value>,
) -> ApiGatewayResponse {
    let envelope = ErrorEnvelope {
        code: code.to_string(),
        message,
        details,
    };
    ApiGatewayResponse {
        status_code,
        headers: json!({"Content-Type": "application/json"}),
        body: serde_json::to_string(&envelope)
            .unwrap_or_else(|_| format!("{{\"code\":\"{code}\",\"message\":\"\"}}")),
    }
}

fn set_header(response: &mut ApiGatewayResponse, name: &str, value: &str) {
    if !response.headers.is_object() {
        response.headers = Value::Object(Map::new());
    }
    if let Value::Object(headers) = &mut response.headers {
        headers.insert(name.to_string(), Value::String(value.to_string()));
    }
}
