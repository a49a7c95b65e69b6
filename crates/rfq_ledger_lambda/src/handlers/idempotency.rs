//! Exactly-once effect for retried mutating requests.
//!
//! A marker is claimed with an `IfAbsent` write before the effect runs and
//! overwritten with the effect's response afterwards. A failed effect deletes
//! its marker. A pending marker is never taken over before the retention
//! window ends: its effect may already have committed.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::adapters::clock::Clock;
use crate::adapters::object_store::{get_optional, ObjectStore, Precondition, StoreError};
use crate::runtime::error::{LedgerError, LedgerResult};
use crate::runtime::ids::generate_claim_id;
use crate::runtime::model::{IdempotencyMarker, MarkerState};
use crate::runtime::storage_keys::idempotency_marker_key;

pub const DEFAULT_MARKER_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_IDEMPOTENCY_KEY_CHARS: usize = 255;
const MAX_CLAIM_ATTEMPTS: u32 = 3;
/// Attempts at recording the response once the effect has committed.
pub const MAX_COMPLETION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome<T> {
    Fresh(T),
    Replayed(T),
}

impl<T> GuardOutcome<T> {
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replayed(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Fresh(value) | Self::Replayed(value) => value,
        }
    }
}

struct ClaimedMarker {
    etag: String,
    claim_id: String,
}

enum Claim<T> {
    Acquired(ClaimedMarker),
    Replay(T),
}

pub struct IdempotencyGuard<'a> {
    store: &'a dyn ObjectStore,
    clock: &'a dyn Clock,
    prefix: &'a str,
    retention: Duration,
}

impl<'a> IdempotencyGuard<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        clock: &'a dyn Clock,
        prefix: &'a str,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            prefix,
            retention,
        }
    }

    /// Runs `effect` at most once per `(scope, token)` while a marker exists.
    /// Without a token the effect simply runs.
    pub fn guard<T, F>(
        &self,
        scope: &str,
        token: Option<&str>,
        request_hash: &str,
        effect: F,
    ) -> LedgerResult<GuardOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> LedgerResult<T>,
    {
        let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) else {
            return effect().map(GuardOutcome::Fresh);
        };
        if token.chars().count() > MAX_IDEMPOTENCY_KEY_CHARS {
            return Err(LedgerError::Validation(format!(
                "Idempotency-Key exceeds {MAX_IDEMPOTENCY_KEY_CHARS} characters"
            )));
        }

        let key = idempotency_marker_key(self.prefix, scope, token);
        let claimed = match self.claim(&key, request_hash)? {
            Claim::Acquired(claimed) => claimed,
            Claim::Replay(value) => {
                info!(scope, marker_key = %key, "replaying stored idempotent response");
                return Ok(GuardOutcome::Replayed(value));
            }
        };

        match effect() {
            Ok(value) => {
                if let Err(failure) = self.complete(&key, claimed, request_hash, &value) {
                    // The marker stays pending, so retries with this token are
                    // refused instead of running the effect a second time.
                    error!(
                        scope,
                        marker_key = %key,
                        error = %failure,
                        "effect committed but its response could not be recorded"
                    );
                    return Err(failure);
                }
                Ok(GuardOutcome::Fresh(value))
            }
            Err(failure) => {
                if let Err(cleanup) = self.store.delete(&key) {
                    warn!(
                        marker_key = %key,
                        error = %cleanup,
                        "failed to release idempotency marker"
                    );
                }
                Err(failure)
            }
        }
    }

    fn claim<T: DeserializeOwned>(&self, key: &str, request_hash: &str) -> LedgerResult<Claim<T>> {
        let claim_id = generate_claim_id();
        let pending = IdempotencyMarker {
            request_hash: request_hash.to_string(),
            state: MarkerState::Pending,
            claim_id: Some(claim_id.clone()),
            response: None,
            ts: self.clock.now(),
        };
        let body = serde_json::to_vec(&pending)?;
        let acquired = |etag: String| {
            Claim::Acquired(ClaimedMarker {
                etag,
                claim_id: claim_id.clone(),
            })
        };

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            match self.store.put(key, &body, &Precondition::IfAbsent) {
                Ok(etag) => return Ok(acquired(etag)),
                Err(StoreError::PreconditionFailed(_)) => {}
                Err(failure) => return Err(failure.into()),
            }

            let Some(existing) = get_optional(self.store, key)? else {
                continue;
            };
            if existing.body == body {
                // This call's own claim; only the response to its write was lost.
                return Ok(acquired(existing.etag));
            }

            let marker = match serde_json::from_slice::<IdempotencyMarker>(&existing.body) {
                Ok(marker) => marker,
                Err(failure) => {
                    warn!(
                        marker_key = %key,
                        error = %failure,
                        "taking over undecodable idempotency marker"
                    );
                    match self.take_over(key, &existing.etag, &body)? {
                        Some(etag) => return Ok(acquired(etag)),
                        None => continue,
                    }
                }
            };

            if self.age_of(&marker) > self.retention {
                match self.take_over(key, &existing.etag, &body)? {
                    Some(etag) => return Ok(acquired(etag)),
                    None => continue,
                }
            }

            if marker.request_hash != request_hash {
                return Err(LedgerError::IdempotencyConflict);
            }

            return match (marker.state, marker.response) {
                (MarkerState::Completed, Some(response)) => {
                    let value = serde_json::from_value(response).map_err(|failure| {
                        LedgerError::Internal(format!(
                            "stored response for {key} is unreadable: {failure}"
                        ))
                    })?;
                    Ok(Claim::Replay(value))
                }
                _ => Err(LedgerError::IdempotencyInProgress),
            };
        }

        Err(LedgerError::IdempotencyInProgress)
    }

    fn take_over(&self, key: &str, etag: &str, body: &[u8]) -> LedgerResult<Option<String>> {
        match self
            .store
            .put(key, body, &Precondition::IfMatch(etag.to_string()))
        {
            Ok(etag) => Ok(Some(etag)),
            Err(StoreError::PreconditionFailed(_)) => Ok(None),
            Err(failure) => Err(failure.into()),
        }
    }

    /// Overwrites the claimed marker with the response. Fails rather than
    /// reporting success when the response cannot be recorded.
    fn complete<T: Serialize>(
        &self,
        key: &str,
        claimed: ClaimedMarker,
        request_hash: &str,
        value: &T,
    ) -> LedgerResult<()> {
        let completed = IdempotencyMarker {
            request_hash: request_hash.to_string(),
            state: MarkerState::Completed,
            claim_id: Some(claimed.claim_id),
            response: Some(serde_json::to_value(value)?),
            ts: self.clock.now(),
        };
        let body = serde_json::to_vec(&completed)?;
        let precondition = Precondition::IfMatch(claimed.etag);

        let mut attempt = 1;
        loop {
            match self.store.put(key, &body, &precondition) {
                Ok(_) => return Ok(()),
                Err(StoreError::PreconditionFailed(_)) => {
                    // An earlier attempt may have landed with its response lost.
                    return match get_optional(self.store, key)? {
                        Some(existing) if existing.body == body => Ok(()),
                        _ => Err(LedgerError::StorageContention {
                            key: key.to_string(),
                            attempts: attempt,
                        }),
                    };
                }
                Err(failure) if failure.is_transient() && attempt < MAX_COMPLETION_ATTEMPTS => {
                    warn!(
                        marker_key = %key,
                        attempt,
                        error = %failure,
                        "retrying idempotent response write"
                    );
                    attempt += 1;
                }
                Err(failure) => return Err(failure.into()),
            }
        }
    }

    fn age_of(&self, marker: &IdempotencyMarker) -> Duration {
        (self.clock.now() - marker.ts).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::adapters::clock::SteppingClock;
    use crate::adapters::memory_store::{InMemoryObjectStore, StoreOperation};
    use crate::adapters::object_store::write_json;
    use crate::adapters::retry::{RetryPolicy, RetryingStore};

    fn clock() -> SteppingClock {
        SteppingClock::frozen(Utc.with_ymd_and_hms(2026, 2, 14, 10, 0, 0).unwrap())
    }

    fn guard<'a>(store: &'a dyn ObjectStore, clock: &'a SteppingClock) -> IdempotencyGuard<'a> {
        IdempotencyGuard::new(store, clock, "", DEFAULT_MARKER_RETENTION)
    }

    #[test]
    fn replays_stored_response_without_rerunning_effect() {
        let store = InMemoryObjectStore::new();
        let clock = clock();
        let guard = guard(&store, &clock);
        let runs = Cell::new(0);

        let first = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || {
                runs.set(runs.get() + 1);
                Ok("r_FIRST".to_string())
            })
            .expect("first call should run");
        let second = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || {
                runs.set(runs.get() + 1);
                Ok("r_SECOND".to_string())
            })
            .expect("second call should replay");

        assert_eq!(first, GuardOutcome::Fresh("r_FIRST".to_string()));
        assert_eq!(second, GuardOutcome::Replayed("r_FIRST".to_string()));
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn rejects_same_token_with_different_body() {
        let store = InMemoryObjectStore::new();
        let clock = clock();
        let guard = guard(&store, &clock);

        guard
            .guard("create_rfq", Some("token-1"), "hash-a", || Ok(1u32))
            .expect("first call should run");
        let error = guard
            .guard("create_rfq", Some("token-1"), "hash-b", || Ok(2u32))
            .expect_err("different body should conflict");
        assert_eq!(error, LedgerError::IdempotencyConflict);
    }

    #[test]
    fn failed_effect_releases_marker() {
        let store = InMemoryObjectStore::new();
        let clock = clock();
        let guard = guard(&store, &clock);

        let error = guard
            .guard::<u32, _>("create_rfq", Some("token-1"), "hash-a", || {
                Err(LedgerError::StorageTransient("timeout".to_string()))
            })
            .expect_err("effect failure should surface");
        assert_eq!(error.code(), "storage_transient");
        assert!(store.keys_with_prefix("idem/").is_empty());

        let retried = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || Ok(7u32))
            .expect("retry should run the effect");
        assert_eq!(retried, GuardOutcome::Fresh(7));
    }

    #[test]
    fn pending_marker_blocks_until_retention_expires() {
        let store = InMemoryObjectStore::new();
        let clock = clock();
        let guard = guard(&store, &clock);
        let key = idempotency_marker_key("", "create_rfq", "token-1");
        let pending = IdempotencyMarker {
            request_hash: "hash-a".to_string(),
            state: MarkerState::Pending,
            claim_id: Some("other-call".to_string()),
            response: None,
            ts: clock.now(),
        };
        write_json(&store, &key, &pending, &Precondition::None).expect("seed marker");

        let error = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || Ok(1u32))
            .expect_err("in-flight request should block");
        assert_eq!(error, LedgerError::IdempotencyInProgress);

        clock.advance(chrono::Duration::hours(2));
        let error = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || Ok(1u32))
            .expect_err("a stale pending marker may hide a committed effect");
        assert_eq!(error, LedgerError::IdempotencyInProgress);

        clock.advance(chrono::Duration::hours(23));
        let outcome = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || Ok(1u32))
            .expect("expired marker should be taken over");
        assert_eq!(outcome, GuardOutcome::Fresh(1));
    }

    #[test]
    fn claim_whose_response_was_lost_still_runs_the_effect() {
        let memory = InMemoryObjectStore::new();
        memory.lose_next_response(StoreOperation::Put, "idem/", 1);
        let store = RetryingStore::new(&memory, RetryPolicy::immediate(3));
        let clock = clock();
        let guard = guard(&store, &clock);
        let runs = Cell::new(0);

        let first = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || {
                runs.set(runs.get() + 1);
                Ok("r_FIRST".to_string())
            })
            .expect("own claim should be recognised");
        assert_eq!(first, GuardOutcome::Fresh("r_FIRST".to_string()));

        let retried = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || {
                runs.set(runs.get() + 1);
                Ok("r_SECOND".to_string())
            })
            .expect("client retry should replay");
        assert_eq!(retried, GuardOutcome::Replayed("r_FIRST".to_string()));
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn completion_write_is_retried_before_reporting_success() {
        let store = InMemoryObjectStore::new();
        let clock = clock();
        let guard = guard(&store, &clock);
        let runs = Cell::new(0);

        let first = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || {
                runs.set(runs.get() + 1);
                store.fail_next(
                    StoreOperation::Put,
                    "idem/",
                    StoreError::Transient("throttled".to_string()),
                    1,
                );
                Ok("r_RUN1".to_string())
            })
            .expect("completion should succeed on retry");
        assert_eq!(first, GuardOutcome::Fresh("r_RUN1".to_string()));

        clock.advance(chrono::Duration::seconds(61));
        let retried = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || {
                runs.set(runs.get() + 1);
                Ok("r_RUN2".to_string())
            })
            .expect("retry should replay");
        assert_eq!(retried, GuardOutcome::Replayed("r_RUN1".to_string()));
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn lost_completion_response_counts_as_recorded() {
        let memory = InMemoryObjectStore::new();
        let store = RetryingStore::new(&memory, RetryPolicy::immediate(3));
        let clock = clock();
        let guard = guard(&store, &clock);

        let outcome = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || {
                memory.lose_next_response(StoreOperation::Put, "idem/", 1);
                Ok(5u32)
            })
            .expect("completion that landed should count");
        assert_eq!(outcome, GuardOutcome::Fresh(5));

        let replayed = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || Ok(6u32))
            .expect("retry should replay");
        assert_eq!(replayed, GuardOutcome::Replayed(5));
    }

    #[test]
    fn unrecorded_response_fails_and_never_reruns_the_effect() {
        let store = InMemoryObjectStore::new();
        let clock = clock();
        let guard = guard(&store, &clock);
        let runs = Cell::new(0);

        let error = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || {
                runs.set(runs.get() + 1);
                store.fail_next(
                    StoreOperation::Put,
                    "idem/",
                    StoreError::Transient("throttled".to_string()),
                    MAX_COMPLETION_ATTEMPTS,
                );
                Ok("r_RUN1".to_string())
            })
            .expect_err("an unrecorded response must not be reported as success");
        assert_eq!(error.code(), "storage_transient");
        assert_eq!(store.keys_with_prefix("idem/").len(), 1);

        clock.advance(chrono::Duration::hours(1));
        let retried = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || {
                runs.set(runs.get() + 1);
                Ok("r_RUN2".to_string())
            })
            .expect_err("the pending marker must keep blocking");
        assert_eq!(retried, LedgerError::IdempotencyInProgress);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn expired_marker_counts_as_never_attempted() {
        let store = InMemoryObjectStore::new();
        let clock = clock();
        let guard = guard(&store, &clock);

        guard
            .guard("create_rfq", Some("token-1"), "hash-a", || Ok(1u32))
            .expect("first call should run");
        clock.advance(chrono::Duration::hours(25));

        let outcome = guard
            .guard("create_rfq", Some("token-1"), "hash-b", || Ok(2u32))
            .expect("expired marker should not conflict");
        assert_eq!(outcome, GuardOutcome::Fresh(2));
    }

    #[test]
    fn scopes_do_not_share_markers() {
        let store = InMemoryObjectStore::new();
        let clock = clock();
        let guard = guard(&store, &clock);

        guard
            .guard("post_message:r_A", Some("token-1"), "hash-a", || Ok(1u32))
            .expect("first scope should run");
        let other = guard
            .guard("post_message:r_B", Some("token-1"), "hash-b", || Ok(2u32))
            .expect("second scope should run independently");
        assert_eq!(other, GuardOutcome::Fresh(2));
    }

    #[test]
    fn storage_failure_while_claiming_is_not_masked() {
        let store = InMemoryObjectStore::new();
        store.fail_next(
            StoreOperation::Put,
            "idem/",
            StoreError::Fatal("access denied".to_string()),
            1,
        );
        let clock = clock();
        let guard = guard(&store, &clock);

        let error = guard
            .guard("create_rfq", Some("token-1"), "hash-a", || Ok(1u32))
            .expect_err("claim failure should surface");
        assert_eq!(
            error,
            LedgerError::StorageFatal("access denied".to_string())
        );
    }

    #[test]
    fn runs_directly_without_token() {
        let store = InMemoryObjectStore::new();
        let clock = clock();
        let guard = guard(&store, &clock);

        let outcome = guard
            .guard("create_rfq", None, "hash-a", || Ok(3u32))
            .expect("untracked call should run");
        assert_eq!(outcome, GuardOutcome::Fresh(3));
        assert!(store.keys_with_prefix("idem/").is_empty());
    }
}
