use std::time::Duration;

use thiserror::Error;

use crate::adapters::retry::RetryPolicy;

pub const DEFAULT_STORE_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_STORE_BASE_BACKOFF_MS: u64 = 50;
pub const DEFAULT_METADATA_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_MARKER_RETENTION_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be configured")]
    Missing(&'static str),

    #[error("{name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub private_bucket: String,
    pub public_bucket: String,
    pub prefix: String,
    pub notify_queue_url: Option<String>,
    pub publish_queue_url: Option<String>,
    pub store_retry: RetryPolicy,
    pub metadata_max_attempts: u32,
    pub marker_retention: Duration,
    pub endpoint_url: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let optional = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required = |name: &'static str| optional(name).ok_or(ConfigError::Missing(name));

        let store_max_attempts = parse_or(
            optional("STORE_MAX_ATTEMPTS"),
            "STORE_MAX_ATTEMPTS",
            DEFAULT_STORE_MAX_ATTEMPTS,
        )?;
        let store_base_backoff_ms = parse_or(
            optional("STORE_BASE_BACKOFF_MS"),
            "STORE_BASE_BACKOFF_MS",
            DEFAULT_STORE_BASE_BACKOFF_MS,
        )?;
        let metadata_max_attempts = parse_or(
            optional("METADATA_MAX_ATTEMPTS"),
            "METADATA_MAX_ATTEMPTS",
            DEFAULT_METADATA_MAX_ATTEMPTS,
        )?;
        let marker_retention_secs = parse_or(
            optional("IDEMPOTENCY_RETENTION_SECS"),
            "IDEMPOTENCY_RETENTION_SECS",
            DEFAULT_MARKER_RETENTION_SECS,
        )?;

        if store_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "STORE_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        if metadata_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "METADATA_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            private_bucket: required("PRIVATE_BUCKET")?,
            public_bucket: required("PUBLIC_BUCKET")?,
            prefix: optional("LEDGER_PREFIX")
                .map(|prefix| prefix.trim_matches('/').to_string())
                .unwrap_or_default(),
            notify_queue_url: optional("NOTIFY_QUEUE_URL"),
            publish_queue_url: optional("PUBLISH_QUEUE_URL"),
            store_retry: RetryPolicy::new(
                store_max_attempts,
                Duration::from_millis(store_base_backoff_ms),
            ),
            metadata_max_attempts,
            marker_retention: Duration::from_secs(marker_retention_secs),
            endpoint_url: optional("AWS_ENDPOINT_URL"),
        })
    }

    /// Backoff between optimistic-concurrency attempts on meta and index.
    pub fn metadata_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.metadata_max_attempts, self.store_retry.base_backoff)
    }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
