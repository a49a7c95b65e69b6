//! Append-only event history per RFQ on top of single-key conditional writes.
//!
//! The event object is the source of truth and is written first. Meta and the
//! side index are caches updated afterwards with a bounded `IfMatch` loop;
//! when that loop gives up the event stays committed and the caches lag
//! until the next append or a reconcile.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use tracing::{info, warn};

use crate::adapters::clock::Clock;
use crate::adapters::object_store::{
    get_optional, list_all_keys, put_if_absent_or_identical, read_json, write_json, ObjectStore,
    Precondition, StoreError,
};
use crate::adapters::retry::RetryPolicy;
use crate::runtime::contract::{LedgerAnomaly, ReconcileResponse};
use crate::runtime::error::{LedgerError, LedgerResult};
use crate::runtime::ids::{generate_event_id, generate_rfq_id, is_valid_rfq_id};
use crate::runtime::model::{
    Contact, EventAuthor, EventDraft, Participant, RfqEvent, RfqIndex, RfqMeta, RfqStatus,
    StatusType,
};
use crate::runtime::pagination::{paginate, EventPage};
use crate::runtime::projection::{
    append_anomalies, apply_event_to_index, apply_event_to_meta, replay,
};
use crate::runtime::storage_keys::{
    event_key_timestamp, event_object_key, rfq_events_prefix, rfq_index_key, rfq_meta_key,
};

const MAX_ID_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub prefix: String,
    pub metadata_retry: RetryPolicy,
}

/// Everything about a new RFQ the caller decides; id, status and timestamps
/// are assigned by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRfq {
    pub tenant_id: String,
    pub manufacturer_id: String,
    pub buyer: Contact,
    pub subject: String,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEvent {
    pub event: RfqEvent,
    /// Meta as read before the append, with the new event applied.
    pub rfq: RfqMeta,
    pub anomalies: Vec<LedgerAnomaly>,
    /// `false` when meta or index could not be brought up to date.
    pub settled: bool,
}

pub struct RfqLedger<'a> {
    store: &'a dyn ObjectStore,
    clock: &'a dyn Clock,
    config: &'a LedgerConfig,
}

impl<'a> RfqLedger<'a> {
    pub fn new(store: &'a dyn ObjectStore, clock: &'a dyn Clock, config: &'a LedgerConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn create_rfq(&self, new_rfq: NewRfq) -> LedgerResult<(RfqMeta, CommittedEvent)> {
        let created_at = self.clock.now().trunc_subsecs(6);

        let mut meta = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = RfqMeta {
                id: generate_rfq_id(),
                tenant_id: new_rfq.tenant_id.clone(),
                manufacturer_id: new_rfq.manufacturer_id.clone(),
                buyer: new_rfq.buyer.clone(),
                subject: new_rfq.subject.clone(),
                status: RfqStatus::Open,
                created_at,
                last_event_ts: None,
                last_event_id: None,
                status_event: None,
                participants: new_rfq.participants.clone(),
            };
            let key = rfq_meta_key(&self.config.prefix, &candidate.id);
            let body = serde_json::to_vec(&candidate)?;
            if put_if_absent_or_identical(self.store, &key, &body)? {
                meta = Some(candidate);
                break;
            }
            warn!(rfq_id = %candidate.id, "rfq id collision; regenerating");
        }
        let meta = meta.ok_or_else(|| {
            LedgerError::Internal("could not allocate an unused rfq id".to_string())
        })?;
        info!(rfq_id = %meta.id, manufacturer_id = %meta.manufacturer_id, "rfq created");

        let created = self.append_event(
            &meta.id,
            EventDraft::status(EventAuthor::System, StatusType::RfqCreated, None),
        )?;
        Ok((meta, created))
    }

    pub fn get_rfq(&self, rfq_id: &str) -> LedgerResult<RfqMeta> {
        self.read_meta(rfq_id).map(|(meta, _)| meta)
    }

    pub fn get_index(&self, rfq_id: &str) -> LedgerResult<RfqIndex> {
        Ok(read_json::<RfqIndex>(self.store, &rfq_index_key(&self.config.prefix, rfq_id))?
            .map(|versioned| versioned.value)
            .unwrap_or_default())
    }

    pub fn append_event(&self, rfq_id: &str, draft: EventDraft) -> LedgerResult<CommittedEvent> {
        let (meta, _) = self.read_meta(rfq_id)?;
        let event = self.commit_event(&meta, draft)?;
        let mut anomalies = append_anomalies(meta.status, &event);
        info!(
            rfq_id,
            event_id = %event.id,
            kind = event.body.kind(),
            ts = %event.ts.to_rfc3339(),
            "event committed"
        );
        if !anomalies.is_empty() {
            warn!(rfq_id, event_id = %event.id, ?anomalies, "event accepted with anomalies");
        }

        let (rfq, meta_anomalies, meta_settled) = self.update_meta(rfq_id, &event, meta);
        anomalies.extend(meta_anomalies);
        let index_settled = self.update_index(rfq_id, &event);

        Ok(CommittedEvent {
            event,
            rfq,
            anomalies,
            settled: meta_settled && index_settled,
        })
    }

    /// Every committed event, sorted by `(ts, id)`.
    pub fn load_all_events(&self, rfq_id: &str) -> LedgerResult<Vec<RfqEvent>> {
        let page = self.scan_events(rfq_id, None, usize::MAX)?;
        Ok(page.items)
    }

    pub fn list_events(
        &self,
        rfq_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> LedgerResult<EventPage> {
        let page = self.scan_events(rfq_id, since, limit)?;
        if page.items.is_empty() {
            // An empty page must still distinguish "nothing new" from "no such rfq".
            self.read_meta(rfq_id)?;
        }
        Ok(page)
    }

    /// Recomputes meta and index from the event set and writes any
    /// difference back.
    pub fn reconcile(&self, rfq_id: &str) -> LedgerResult<ReconcileResponse> {
        let mut events = self.load_all_events(rfq_id)?;
        let mut corrected = false;

        let mut attempt = 1;
        let rebuilt_meta = loop {
            let (current, etag) = self.read_meta(rfq_id)?;
            let seen = |id: &String| events.iter().any(|event| &event.id == id);
            let unseen_event = current.last_event_id.as_ref().is_some_and(|id| !seen(id))
                || current.status_event.as_ref().is_some_and(|status| !seen(&status.id));
            if unseen_event && attempt < self.config.metadata_retry.max_attempts {
                // An append landed after the scan; rescan rather than rewind the cache.
                events = self.load_all_events(rfq_id)?;
                attempt += 1;
                continue;
            }
            let (rebuilt, _) = replay(&current, &events);
            if rebuilt == current {
                break rebuilt;
            }
            match write_json(
                self.store,
                &rfq_meta_key(&self.config.prefix, rfq_id),
                &rebuilt,
                &Precondition::IfMatch(etag),
            ) {
                Ok(_) => {
                    corrected = true;
                    break rebuilt;
                }
                Err(StoreError::PreconditionFailed(key)) => {
                    if attempt >= self.config.metadata_retry.max_attempts {
                        return Err(LedgerError::StorageContention { key, attempts: attempt });
                    }
                    self.config.metadata_retry.pause(attempt);
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        };

        let (_, rebuilt_index) = replay(&rebuilt_meta, &events);
        let index_key = rfq_index_key(&self.config.prefix, rfq_id);
        let mut attempt = 1;
        loop {
            let current = read_json::<RfqIndex>(self.store, &index_key)?;
            let precondition = match &current {
                Some(versioned) if versioned.value.same_totals(&rebuilt_index) => break,
                Some(versioned) => Precondition::IfMatch(versioned.etag.clone()),
                None => Precondition::IfAbsent,
            };
            match write_json(self.store, &index_key, &rebuilt_index, &precondition) {
                Ok(_) => {
                    corrected = true;
                    break;
                }
                Err(StoreError::PreconditionFailed(key)) => {
                    if attempt >= self.config.metadata_retry.max_attempts {
                        return Err(LedgerError::StorageContention { key, attempts: attempt });
                    }
                    self.config.metadata_retry.pause(attempt);
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }

        info!(
            rfq_id,
            count = rebuilt_index.count,
            corrected,
            "rfq reconciled"
        );
        Ok(ReconcileResponse {
            rfq_id: rfq_id.to_string(),
            count: rebuilt_index.count,
            last_event_ts: rebuilt_meta.last_event_ts,
            status: rebuilt_meta.status,
            corrected,
        })
    }

    fn read_meta(&self, rfq_id: &str) -> LedgerResult<(RfqMeta, String)> {
        if !is_valid_rfq_id(rfq_id) {
            return Err(LedgerError::NotFound(format!("rfq {rfq_id}")));
        }
        read_json::<RfqMeta>(self.store, &rfq_meta_key(&self.config.prefix, rfq_id))?
            .map(|versioned| (versioned.value, versioned.etag))
            .ok_or_else(|| LedgerError::NotFound(format!("rfq {rfq_id}")))
    }

    /// Strictly after the last known event, truncated to the microsecond
    /// precision the key layout records.
    fn next_timestamp(&self, meta: &RfqMeta) -> DateTime<Utc> {
        let now = self.clock.now().trunc_subsecs(6);
        match meta.last_event_ts {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        }
    }

    fn commit_event(&self, meta: &RfqMeta, draft: EventDraft) -> LedgerResult<RfqEvent> {
        let ts = self.next_timestamp(meta);
        for _ in 0..MAX_ID_ATTEMPTS {
            let event = RfqEvent {
                id: generate_event_id(),
                rfq_id: meta.id.clone(),
                ts,
                by: draft.by,
                body: draft.body.clone(),
            };
            let key = event_object_key(&self.config.prefix, &meta.id, event.ts, &event.id);
            let body = serde_json::to_vec(&event)?;
            if put_if_absent_or_identical(self.store, &key, &body)? {
                return Ok(event);
            }
            warn!(rfq_id = %meta.id, event_id = %event.id, "event key collision; regenerating id");
        }
        Err(LedgerError::Internal(format!(
            "could not allocate an unused event id for rfq {}",
            meta.id
        )))
    }

    fn update_meta(
        &self,
        rfq_id: &str,
        event: &RfqEvent,
        first_read: RfqMeta,
    ) -> (RfqMeta, Vec<LedgerAnomaly>, bool) {
        let key = rfq_meta_key(&self.config.prefix, rfq_id);
        let policy = self.config.metadata_retry;
        let mut fallback = first_read;
        apply_event_to_meta(&mut fallback, event);

        for attempt in 1..=policy.max_attempts {
            let (mut meta, etag) = match self.read_meta(rfq_id) {
                Ok(current) => current,
                Err(error) => {
                    warn!(rfq_id, error = %error, "could not read meta after commit; cache lags");
                    return (fallback, Vec::new(), false);
                }
            };
            let change = apply_event_to_meta(&mut meta, event);
            if !change.changed {
                return (meta, change.anomalies, true);
            }
            match write_json(self.store, &key, &meta, &Precondition::IfMatch(etag)) {
                Ok(_) => return (meta, change.anomalies, true),
                Err(StoreError::PreconditionFailed(_)) => {
                    if attempt < policy.max_attempts {
                        policy.pause(attempt);
                    }
                }
                Err(error) => {
                    warn!(rfq_id, error = %error, "meta update failed after commit; cache lags");
                    return (fallback, change.anomalies, false);
                }
            }
        }

        let contention = LedgerError::StorageContention {
            key,
            attempts: policy.max_attempts,
        };
        warn!(
            rfq_id,
            event_id = %event.id,
            code = contention.code(),
            error = %contention,
            "meta cache lags behind committed event"
        );
        (fallback, Vec::new(), false)
    }

    fn update_index(&self, rfq_id: &str, event: &RfqEvent) -> bool {
        let key = rfq_index_key(&self.config.prefix, rfq_id);
        let policy = self.config.metadata_retry;

        for attempt in 1..=policy.max_attempts {
            let (mut index, precondition) = match read_json::<RfqIndex>(self.store, &key) {
                Ok(Some(versioned)) => (versioned.value, Precondition::IfMatch(versioned.etag)),
                Ok(None) => (RfqIndex::default(), Precondition::IfAbsent),
                Err(error) => {
                    warn!(rfq_id, error = %error, "could not read index after commit; cache lags");
                    return false;
                }
            };
            if !apply_event_to_index(&mut index, event) {
                return true;
            }
            match write_json(self.store, &key, &index, &precondition) {
                Ok(_) => return true,
                Err(StoreError::PreconditionFailed(_)) => {
                    if attempt < policy.max_attempts {
                        policy.pause(attempt);
                    }
                }
                Err(error) => {
                    warn!(rfq_id, error = %error, "index update failed after commit; cache lags");
                    return false;
                }
            }
        }

        let contention = LedgerError::StorageContention {
            key,
            attempts: policy.max_attempts,
        };
        warn!(
            rfq_id,
            event_id = %event.id,
            code = contention.code(),
            error = %contention,
            "index cache lags behind committed event"
        );
        false
    }

    /// Full scan of the event prefix. Keys whose embedded timestamp is not
    /// after `since` are skipped without being fetched.
    fn scan_events(
        &self,
        rfq_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> LedgerResult<EventPage> {
        if !is_valid_rfq_id(rfq_id) {
            return Err(LedgerError::NotFound(format!("rfq {rfq_id}")));
        }
        let keys = list_all_keys(self.store, &rfq_events_prefix(&self.config.prefix, rfq_id))?;

        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            if let (Some(since), Some(key_ts)) = (since, event_key_timestamp(&key)) {
                if key_ts <= since {
                    continue;
                }
            }
            let Some(object) = get_optional(self.store, &key)? else {
                continue;
            };
            match serde_json::from_slice::<RfqEvent>(&object.body) {
                Ok(event) if event.rfq_id == rfq_id => events.push(event),
                Ok(event) => warn!(
                    rfq_id,
                    event_key = %key,
                    foreign_rfq_id = %event.rfq_id,
                    "skipping event filed under another rfq"
                ),
                Err(error) => warn!(
                    rfq_id,
                    event_key = %key,
                    error = %error,
                    "skipping undecodable event object"
                ),
            }
        }

        Ok(paginate(events, since, limit))
    }
}
