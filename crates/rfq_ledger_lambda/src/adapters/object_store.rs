use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::runtime::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    None,
    IfAbsent,
    IfMatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub etag: String,
}

/// One page of a prefix listing. Keys come back in no particular order;
/// `continuation` restarts the listing after this page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("precondition failed for {0}")]
    PreconditionFailed(String),

    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StoreError> for LedgerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(key) => LedgerError::NotFound(key),
            StoreError::PreconditionFailed(key) => {
                LedgerError::StorageContention { key, attempts: 1 }
            }
            StoreError::Transient(message) => LedgerError::StorageTransient(message),
            StoreError::Fatal(message) => LedgerError::StorageFatal(message),
        }
    }
}

/// Keyed byte blobs with single-key conditional writes. No operation spans
/// more than one key.
pub trait ObjectStore {
    fn get(&self, key: &str) -> Result<StoredObject, StoreError>;

    /// Returns the etag of the written object.
    fn put(
        &self,
        key: &str,
        body: &[u8],
        precondition: &Precondition,
    ) -> Result<String, StoreError>;

    fn list_page(&self, prefix: &str, continuation: Option<&str>) -> Result<ObjectPage, StoreError>;

    /// Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for &T {
    fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        (**self).get(key)
    }

    fn put(
        &self,
        key: &str,
        body: &[u8],
        precondition: &Precondition,
    ) -> Result<String, StoreError> {
        (**self).put(key, body, precondition)
    }

    fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StoreError> {
        (**self).list_page(prefix, continuation)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub etag: String,
}

pub fn get_optional(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Option<StoredObject>, StoreError> {
    match store.get(key) {
        Ok(object) => Ok(Some(object)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(error) => Err(error),
    }
}

pub fn read_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    key: &str,
) -> LedgerResult<Option<Versioned<T>>> {
    let Some(object) = get_optional(store, key)? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&object.body)
        .map_err(|error| LedgerError::Internal(format!("corrupt object {key}: {error}")))?;
    Ok(Some(Versioned {
        value,
        etag: object.etag,
    }))
}

pub fn write_json(
    store: &dyn ObjectStore,
    key: &str,
    value: &impl Serialize,
    precondition: &Precondition,
) -> Result<String, StoreError> {
    let body = serde_json::to_vec(value)
        .map_err(|error| StoreError::Fatal(format!("failed to encode {key}: {error}")))?;
    store.put(key, &body, precondition)
}

/// Writes `body` only if the key is free. A key already holding exactly
/// `body` counts as written: it is what a retried put whose first response
/// was lost looks like.
pub fn put_if_absent_or_identical(
    store: &dyn ObjectStore,
    key: &str,
    body: &[u8],
) -> Result<bool, StoreError> {
    match store.put(key, body, &Precondition::IfAbsent) {
        Ok(_) => Ok(true),
        Err(StoreError::PreconditionFailed(_)) => match get_optional(store, key)? {
            Some(existing) => Ok(existing.body == body),
            None => Ok(false),
        },
        Err(error) => Err(error),
    }
}

/// Follows continuation tokens until the listing is exhausted. The result is
/// deduplicated but otherwise unordered.
pub fn list_all_keys(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<String>, StoreError> {
    let mut keys = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = store.list_page(prefix, continuation.as_deref())?;
        keys.extend(page.keys);
        match page.continuation {
            Some(next) if Some(&next) != continuation.as_ref() => continuation = Some(next),
            Some(_) => {
                warn!(
                    prefix,
                    "listing returned a repeated continuation token; stopping"
                );
                break;
            }
            None => break,
        }
    }
    keys.sort_unstable();
    keys.dedup();
    Ok(keys)
}
