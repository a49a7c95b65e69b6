use lambda_runtime::{service_fn, Error, LambdaEvent};
use rfq_ledger_lambda::adapters::aws::{load_sdk_config, s3_client, sqs_client};
use rfq_ledger_lambda::adapters::clock::SystemClock;
use rfq_ledger_lambda::adapters::notifier::{EventNotifier, NoopNotifier, SqsNotifier};
use rfq_ledger_lambda::adapters::quota::AllowAllQuota;
use rfq_ledger_lambda::adapters::retry::RetryingStore;
use rfq_ledger_lambda::adapters::s3_store::S3ObjectStore;
use rfq_ledger_lambda::config::RuntimeConfig;
use rfq_ledger_lambda::handlers::api::{handle_api_event, ApiContext, ApiGatewayResponse};
use rfq_ledger_lambda::handlers::ledger::LedgerConfig;
use rfq_ledger_lambda::logging::init_json_logging;
use serde_json::Value;
use tracing::info;

struct RuntimeDependencies {
    config: RuntimeConfig,
    ledger_config: LedgerConfig,
    private_store: RetryingStore<S3ObjectStore>,
    public_store: RetryingStore<S3ObjectStore>,
    notifier: Option<SqsNotifier>,
    publish_queue: Option<SqsNotifier>,
}

async fn build_dependencies() -> Result<RuntimeDependencies, Error> {
    let config = RuntimeConfig::from_env().map_err(|error| Error::from(error.to_string()))?;
    let sdk_config = load_sdk_config(config.endpoint_url.as_deref()).await;
    let s3 = s3_client(&sdk_config, config.endpoint_url.is_some());
    let sqs = sqs_client(&sdk_config);

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
        notifier: config
            .notify_queue_url
            .as_ref()
            .map(|url| SqsNotifier::new(url.clone(), sqs.clone())),
        publish_queue: config
            .publish_queue_url
            .as_ref()
            .map(|url| SqsNotifier::new(url.clone(), sqs.clone())),
        config,
    })
}

async fn handle_request(
    event: LambdaEvent<Value>,
    deps: &RuntimeDependencies,
) -> Result<ApiGatewayResponse, Error> {
    let clock = SystemClock;
    let noop_notifier = NoopNotifier;
    let context = ApiContext {
        private_store: &deps.private_store,
        public_store: &deps.public_store,
        clock: &clock,
        notifier: deps
            .notifier
            .as_ref()
            .map(|value| value as &dyn EventNotifier)
            .unwrap_or(&noop_notifier),
        publish_queue: deps
            .publish_queue
            .as_ref()
            .map(|value| value as &dyn EventNotifier),
        quota: &AllowAllQuota,
        ledger_config: &deps.ledger_config,
        marker_retention: deps.config.marker_retention,
    };
    Ok(handle_api_event(event.payload, &context))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_json_logging();
    let deps = build_dependencies().await?;
    info!(
        private_bucket = %deps.config.private_bucket,
        public_bucket = %deps.config.public_bucket,
        notifications = deps.notifier.is_some(),
        "api lambda initialized"
    );

    let deps = &deps;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        handle_request(event, deps).await
    }))
    .await
}
