use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::object_store::{ObjectPage, ObjectStore, Precondition, StoreError, StoredObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff: base_backoff.saturating_mul(32),
        }
    }

    /// No sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Full-jitter exponential delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }

    pub fn pause(&self, attempt: u32) {
        let delay = self.backoff(attempt);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// Retries `Transient` failures of the wrapped store. Every other error,
/// including `PreconditionFailed`, is returned on first sight.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ObjectStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn run<T>(
        &self,
        operation: &str,
        key: &str,
        mut call: impl FnMut(&S) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1;
        loop {
            match call(&self.inner) {
                Err(error) if error.is_transient() && attempt < self.policy.max_attempts => {
                    warn!(
                        operation,
                        key,
                        attempt,
                        error = %error,
                        "retrying transient store failure"
                    );
                    self.policy.pause(attempt);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl<S: ObjectStore> ObjectStore for RetryingStore<S> {
    fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        self.run("get", key, |store| store.get(key))
    }

    fn put(
        &self,
        key: &str,
        body: &[u8],
        precondition: &Precondition,
    ) -> Result<String, StoreError> {
        self.run("put", key, |store| store.put(key, body, precondition))
    }

    fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StoreError> {
        self.run("list", prefix, |store| store.list_page(prefix, continuation))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.run("delete", key, |store| store.delete(key))
    }
}
