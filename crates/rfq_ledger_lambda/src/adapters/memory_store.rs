//! In-process object store for tests and local runs.
//!
//! Listing order is deliberately not lexical: keys are paged in the order of
//! a fixed hash so callers cannot come to rely on store ordering.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use super::object_store::{ObjectPage, ObjectStore, Precondition, StoreError, StoredObject};

const DEFAULT_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Get,
    Put,
    List,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTiming {
    /// The call fails without touching any state.
    BeforeApply,
    /// The call takes effect, then its response is lost.
    AfterApply,
}

/// Fails the next `remaining` matching calls with `error`.
#[derive(Debug, Clone)]
pub struct InjectedFault {
    pub operation: StoreOperation,
    pub key_contains: String,
    pub error: StoreError,
    pub timing: FaultTiming,
    pub remaining: u32,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    body: Vec<u8>,
    version: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<String, StoredEntry>,
    next_version: u64,
    faults: Vec<InjectedFault>,
    write_log: Vec<String>,
}

#[derive(Debug)]
pub struct InMemoryObjectStore {
    state: Mutex<StoreState>,
    page_size: usize,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            page_size: page_size.max(1),
        }
    }

    pub fn inject_fault(&self, fault: InjectedFault) {
        self.lock().faults.push(fault);
    }

    pub fn fail_next(
        &self,
        operation: StoreOperation,
        key_contains: &str,
        error: StoreError,
        times: u32,
    ) {
        self.inject_fault(InjectedFault {
            operation,
            key_contains: key_contains.to_string(),
            error,
            timing: FaultTiming::BeforeApply,
            remaining: times,
        });
    }

    /// The next `times` matching calls are applied but report a transient
    /// failure, as when a response times out in flight.
    pub fn lose_next_response(&self, operation: StoreOperation, key_contains: &str, times: u32) {
        self.inject_fault(InjectedFault {
            operation,
            key_contains: key_contains.to_string(),
            error: StoreError::Transient("response lost".to_string()),
            timing: FaultTiming::AfterApply,
            remaining: times,
        });
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).map(|entry| entry.body.clone())
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Keys of every successful put, in call order.
    pub fn write_log(&self) -> Vec<String> {
        self.lock().write_log.clone()
    }

    pub fn clear_write_log(&self) {
        self.lock().write_log.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take_fault(
        state: &mut StoreState,
        operation: StoreOperation,
        key: &str,
    ) -> Option<(StoreError, FaultTiming)> {
        let position = state.faults.iter().position(|fault| {
            fault.operation == operation
                && fault.remaining > 0
                && key.contains(&fault.key_contains)
        })?;
        let fault = &mut state.faults[position];
        fault.remaining -= 1;
        let taken = (fault.error.clone(), fault.timing);
        if fault.remaining == 0 {
            state.faults.remove(position);
        }
        Some(taken)
    }

    fn apply_put(
        state: &mut StoreState,
        key: &str,
        body: &[u8],
        precondition: &Precondition,
    ) -> Result<String, StoreError> {
        let current = state.objects.get(key).map(|entry| etag_for(entry.version));
        let allowed = match precondition {
            Precondition::None => true,
            Precondition::IfAbsent => current.is_none(),
            Precondition::IfMatch(expected) => current.as_deref() == Some(expected.as_str()),
        };
        if !allowed {
            return Err(StoreError::PreconditionFailed(key.to_string()));
        }

        state.next_version += 1;
        let version = state.next_version;
        state.objects.insert(
            key.to_string(),
            StoredEntry {
                body: body.to_vec(),
                version,
            },
        );
        state.write_log.push(key.to_string());
        Ok(etag_for(version))
    }
}

fn etag_for(version: u64) -> String {
    format!("\"v{version}\"")
}

fn listing_rank(key: &str) -> (u64, String) {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish(), key.to_string())
}

impl ObjectStore for InMemoryObjectStore {
    fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        let mut state = self.lock();
        if let Some((error, _)) = Self::take_fault(&mut state, StoreOperation::Get, key) {
            return Err(error);
        }
        state
            .objects
            .get(key)
            .map(|entry| StoredObject {
                body: entry.body.clone(),
                etag: etag_for(entry.version),
            })
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn put(
        &self,
        key: &str,
        body: &[u8],
        precondition: &Precondition,
    ) -> Result<String, StoreError> {
        let mut state = self.lock();
        match Self::take_fault(&mut state, StoreOperation::Put, key) {
            Some((error, FaultTiming::BeforeApply)) => Err(error),
            Some((error, FaultTiming::AfterApply)) => {
                Self::apply_put(&mut state, key, body, precondition)?;
                Err(error)
            }
            None => Self::apply_put(&mut state, key, body, precondition),
        }
    }

    fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StoreError> {
        let mut state = self.lock();
        if let Some((error, _)) = Self::take_fault(&mut state, StoreOperation::List, prefix) {
            return Err(error);
        }

        let after = continuation.map(listing_rank);
        let mut ranked: Vec<(u64, String)> = state
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .map(|key| listing_rank(key))
            .filter(|rank| after.as_ref().map_or(true, |after| rank > after))
            .collect();
        ranked.sort();

        let has_more = ranked.len() > self.page_size;
        ranked.truncate(self.page_size);
        let continuation = if has_more {
            ranked.last().map(|(_, key)| key.clone())
        } else {
            None
        };

        Ok(ObjectPage {
            keys: ranked.into_iter().map(|(_, key)| key).collect(),
            continuation,
        })
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        match Self::take_fault(&mut state, StoreOperation::Delete, key) {
            Some((error, FaultTiming::BeforeApply)) => Err(error),
            Some((error, FaultTiming::AfterApply)) => {
                state.objects.remove(key);
                Err(error)
            }
            None => {
                state.objects.remove(key);
                Ok(())
            }
        }
    }
}
