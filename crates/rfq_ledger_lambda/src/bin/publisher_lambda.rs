use lambda_runtime::{service_fn, Error, LambdaEvent};
use rfq_ledger_lambda::adapters::aws::{load_sdk_config, s3_client};
use rfq_ledger_lambda::adapters::clock::SystemClock;
use rfq_ledger_lambda::adapters::retry::RetryingStore;
use rfq_ledger_lambda::adapters::s3_store::S3ObjectStore;
use rfq_ledger_lambda::config::RuntimeConfig;
use rfq_ledger_lambda::handlers::catalog::CatalogPublisher;
use rfq_ledger_lambda::handlers::ledger::{LedgerConfig, RfqLedger};
use rfq_ledger_lambda::handlers::publisher::{
    decode_publish_requests, handle_publish_request, merge_publish_requests,
};
use rfq_ledger_lambda::logging::init_json_logging;
use serde_json::Value;
use tracing::{error, info};

struct RuntimeDependencies {
    ledger_config: LedgerConfig,
    private_store: RetryingStore<S3ObjectStore>,
    public_store: RetryingStore<S3ObjectStore>,
}

async fn build_dependencies() -> Result<RuntimeDependencies, Error> {
    let config = RuntimeConfig::from_env().map_err(|error| Error::from(error.to_string()))?;
    let sdk_config = load_sdk_config(config.endpoint_url.as_deref()).await;
    let s3 = s3_client(&sdk_config, config.endpoint_url.is_some());

    Ok(RuntimeDependencies {
        ledger_config: LedgerConfig {
            prefix: config.prefix.clone(),
            metadata_retry: config.metadata_retry(),
        },
        private_store: RetryingStore::new(
            S3ObjectStore::new(config.private_bucket.clone(), s3.clone()),
            config.store_retry,
        ),
        public_store: RetryingStore::new(
            S3ObjectStore::new(config.public_bucket.clone(), s3),
            config.store_retry,
        ),
    })
}

async fn handle_request(
    event: LambdaEvent<Value>,
    deps: &RuntimeDependencies,
) -> Result<Value, Error> {
    let requests = decode_publish_requests(event.payload).map_err(Error::from)?;
    let request = merge_publish_requests(requests);

    let clock = SystemClock;
    let ledger = RfqLedger::new(&deps.private_store, &clock, &deps.ledger_config);
    let catalog = CatalogPublisher::new(&deps.public_store, &clock, &deps.ledger_config.prefix);

    // An error fails the whole batch so SQS redelivers it; rebuilds are idempotent.
    let summary = handle_publish_request(&request, &catalog, &ledger).map_err(|failure| {
        error!(code = failure.code(), error = %failure, "publish request failed");
        Error::from(failure.to_string())
    })?;
    info!(rebuilt_slices = ?summary.rebuilt_slices, "catalog published");

    serde_json::to_value(summary)
        .map_err(|error| Error::from(format!("failed to serialize publish summary: {error}")))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_json_logging();
    let deps = build_dependencies().await?;

    let deps = &deps;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_request(event, deps).await
    }))
    .await
}
