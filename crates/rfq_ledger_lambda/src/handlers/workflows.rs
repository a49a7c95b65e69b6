//! Mutating RFQ requests: boundary validation, idempotency, ledger appends
//! and post-commit notification, in that order.

use tracing::info;

use crate::adapters::notifier::{dispatch_notification, EventNotifier, NotificationKind};
use crate::handlers::catalog::CatalogPublisher;
use crate::handlers::idempotency::{GuardOutcome, IdempotencyGuard};
use crate::handlers::ledger::{CommittedEvent, NewRfq, RfqLedger};
use crate::runtime::contract::{
    normalize_create_rfq, normalize_message, normalize_status, request_fingerprint,
    AttachmentInput, CreateRfqRequest, CreateRfqResponse, EventCommittedResponse,
    PostMessageRequest, PostStatusRequest, ResponseWarning, StatusPostedResponse,
};
use crate::runtime::error::{LedgerError, LedgerResult};
use crate::runtime::model::{EventAuthor, EventDraft, Participant, ParticipantRole};

pub const CREATE_RFQ_SCOPE: &str = "create_rfq";

pub struct RfqWorkflows<'a> {
    ledger: &'a RfqLedger<'a>,
    catalog: &'a CatalogPublisher<'a>,
    guard: &'a IdempotencyGuard<'a>,
    notifier: &'a dyn EventNotifier,
}

impl<'a> RfqWorkflows<'a> {
    pub fn new(
        ledger: &'a RfqLedger<'a>,
        catalog: &'a CatalogPublisher<'a>,
        guard: &'a IdempotencyGuard<'a>,
        notifier: &'a dyn EventNotifier,
    ) -> Self {
        Self {
            ledger,
            catalog,
            guard,
            notifier,
        }
    }

    /// Creates the RFQ and appends `rfq_created`, the buyer's opening message
    /// and, when files were supplied, one attachment event.
    pub fn create_rfq(
        &self,
        request: CreateRfqRequest,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<GuardOutcome<CreateRfqResponse>> {
        let normalized = normalize_create_rfq(request)?;
        let request_hash = request_fingerprint(&normalized)?;

        self.guard
            .guard(CREATE_RFQ_SCOPE, idempotency_key, &request_hash, || {
                let manufacturer = self
                    .catalog
                    .get_manufacturer(&normalized.manufacturer_id)?
                    .ok_or_else(|| {
                        LedgerError::NotFound(format!(
                            "manufacturer {}",
                            normalized.manufacturer_id
                        ))
                    })?;

                let mut participants = vec![Participant {
                    role: ParticipantRole::Buyer,
                    email: normalized.buyer.email.clone(),
                    name: normalized.buyer.name.clone(),
                }];
                if let Some(email) = &manufacturer.contact_email {
                    participants.push(Participant {
                        role: ParticipantRole::Manufacturer,
                        email: email.clone(),
                        name: Some(manufacturer.name.clone()),
                    });
                }

                let (meta, created) = self.ledger.create_rfq(NewRfq {
                    tenant_id: normalized
                        .tenant_id
                        .clone()
                        .unwrap_or_else(|| manufacturer.tenant_id.clone()),
                    manufacturer_id: manufacturer.id.clone(),
                    buyer: normalized.buyer.clone(),
                    subject: normalized.subject.clone(),
                    participants,
                })?;

                let message = self.ledger.append_event(
                    &meta.id,
                    EventDraft::message(EventAuthor::Buyer, normalized.body.clone()),
                )?;
                let attachment = self.append_attachments(
                    &meta.id,
                    EventAuthor::Buyer,
                    &normalized.attachments,
                )?;
                let warnings = lag_warnings([Some(&created), Some(&message), attachment.as_ref()]);
                let last = attachment.unwrap_or_else(|| message.clone());

                dispatch_notification(
                    self.notifier,
                    NotificationKind::RfqCreated,
                    &last.rfq,
                    &message.event,
                );
                Ok(CreateRfqResponse {
                    id: meta.id,
                    last_event_ts: last.event.ts,
                    warnings,
                })
            })
    }

    pub fn post_message(
        &self,
        rfq_id: &str,
        request: PostMessageRequest,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<GuardOutcome<EventCommittedResponse>> {
        let normalized = normalize_message(request)?;
        let request_hash = request_fingerprint(&normalized)?;
        let scope = format!("post_message:{rfq_id}");

        self.guard.guard(&scope, idempotency_key, &request_hash, || {
            let message = self.ledger.append_event(
                rfq_id,
                EventDraft::message(normalized.by, normalized.body.clone()),
            )?;
            let attachment =
                self.append_attachments(rfq_id, normalized.by, &normalized.attachments)?;
            let warnings = lag_warnings([Some(&message), attachment.as_ref()]);
            let last = attachment.unwrap_or_else(|| message.clone());

            dispatch_notification(
                self.notifier,
                NotificationKind::MessagePosted,
                &last.rfq,
                &message.event,
            );
            Ok(EventCommittedResponse {
                id: message.event.id,
                ts: message.event.ts,
                warnings,
            })
        })
    }

    pub fn post_status(
        &self,
        rfq_id: &str,
        request: PostStatusRequest,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<GuardOutcome<StatusPostedResponse>> {
        let normalized = normalize_status(request)?;
        let request_hash = request_fingerprint(&normalized)?;
        let scope = format!("post_status:{rfq_id}");

        self.guard.guard(&scope, idempotency_key, &request_hash, || {
            let committed = self.ledger.append_event(
                rfq_id,
                EventDraft::status(normalized.by, normalized.status, normalized.note.clone()),
            )?;
            info!(
                rfq_id,
                event_id = %committed.event.id,
                status = committed.rfq.status.as_str(),
                settled = committed.settled,
                "status posted"
            );

            dispatch_notification(
                self.notifier,
                NotificationKind::StatusChanged,
                &committed.rfq,
                &committed.event,
            );
            let warnings = lag_warnings([Some(&committed)]);
            Ok(StatusPostedResponse {
                id: committed.event.id,
                ts: committed.event.ts,
                status: committed.rfq.status,
                anomalies: committed.anomalies,
                warnings,
            })
        })
    }

    fn append_attachments(
        &self,
        rfq_id: &str,
        by: EventAuthor,
        attachments: &[AttachmentInput],
    ) -> LedgerResult<Option<CommittedEvent>> {
        if attachments.is_empty() {
            return Ok(None);
        }
        let refs = attachments
            .iter()
            .cloned()
            .map(AttachmentInput::into_attachment_ref)
            .collect();
        self.ledger
            .append_event(rfq_id, EventDraft::attachments(by, refs))
            .map(Some)
    }
}

fn lag_warnings<'e>(
    appended: impl IntoIterator<Item = Option<&'e CommittedEvent>>,
) -> Vec<ResponseWarning> {
    let lagging = appended
        .into_iter()
        .flatten()
        .any(|committed| !committed.settled);
    if lagging {
        vec![ResponseWarning::StorageContention]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Value;

    use super::*;
    use crate::adapters::clock::SteppingClock;
    use crate::adapters::memory_store::{InMemoryObjectStore, StoreOperation};
    use crate::adapters::object_store::StoreError;
    use crate::adapters::retry::RetryPolicy;
    use crate::handlers::ledger::LedgerConfig;
    use crate::runtime::contract::{ContactInput, LedgerAnomaly, UpsertManufacturerRequest};
    use crate::runtime::model::{EventBody, Location, RfqStatus, StatusType};

    const RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

    struct Fixture {
        private: InMemoryObjectStore,
        public: InMemoryObjectStore,
        clock: SteppingClock,
        config: LedgerConfig,
        notifications: Mutex<Vec<Value>>,
    }

    impl Fixture {
        fn new() -> Self {
            let start: DateTime<Utc> = Utc.with_ymd_and_hms(2026, 2, 14, 10, 0, 0).unwrap();
            let fixture = Self {
                private: InMemoryObjectStore::new(),
                public: InMemoryObjectStore::new(),
                clock: SteppingClock::new(start, chrono::Duration::milliseconds(5)),
                config: LedgerConfig {
                    prefix: String::new(),
                    metadata_retry: RetryPolicy::immediate(3),
                },
                notifications: Mutex::new(Vec::new()),
            };
            CatalogPublisher::new(&fixture.public, &fixture.clock, "")
                .put_manufacturer(UpsertManufacturerRequest {
                    id: "mfg_123".to_string(),
                    tenant_id: "tenant-a".to_string(),
                    name: "Acme Machining".to_string(),
                    description: None,
                    location: Location::default(),
                    categories: vec!["cnc".to_string()],
                    capabilities: Vec::new(),
                    contact_email: Some("sales@acme.example".to_string()),
                })
                .expect("manufacturer should be written");
            fixture
        }

        fn run<T>(&self, body: impl FnOnce(&RfqWorkflows<'_>) -> T) -> T {
            let ledger = RfqLedger::new(&self.private, &self.clock, &self.config);
            let catalog = CatalogPublisher::new(&self.public, &self.clock, "");
            let guard = IdempotencyGuard::new(&self.private, &self.clock, "", RETENTION);
            let notifier = |payload: &[u8]| -> Result<(), String> {
                let value = serde_json::from_slice(payload).map_err(|error| error.to_string())?;
                self.notifications.lock().expect("poisoned mutex").push(value);
                Ok(())
            };
            let workflows = RfqWorkflows::new(&ledger, &catalog, &guard, &notifier);
            body(&workflows)
        }

        fn events(&self, rfq_id: &str) -> Vec<crate::runtime::model::RfqEvent> {
            RfqLedger::new(&self.private, &self.clock, &self.config)
                .load_all_events(rfq_id)
                .expect("events should load")
        }
    }

    fn create_request() -> CreateRfqRequest {
        CreateRfqRequest {
            tenant_id: None,
            manufacturer_id: "mfg_123".to_string(),
            buyer: ContactInput {
                email: "a@b.com".to_string(),
                name: None,
            },
            subject: "CNC prototype".to_string(),
            body: "2 parts, 6061".to_string(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn create_appends_creation_marker_then_message() {
        let fixture = Fixture::new();
        let created = fixture
            .run(|workflows| workflows.create_rfq(create_request(), None))
            .expect("create should succeed")
            .into_inner();

        let events = fixture.events(&created.id);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].body,
            EventBody::Status {
                status: StatusType::RfqCreated,
                ..
            }
        ));
        assert!(matches!(&events[1].body, EventBody::Message { body } if body == "2 parts, 6061"));
        assert_eq!(created.last_event_ts, events[1].ts);

        let meta = RfqLedger::new(&fixture.private, &fixture.clock, &fixture.config)
            .get_rfq(&created.id)
            .expect("meta should exist");
        assert_eq!(meta.tenant_id, "tenant-a");
        assert_eq!(meta.participants.len(), 2);
        assert_eq!(meta.participants[1].email, "sales@acme.example");

        let notifications = fixture.notifications.lock().expect("poisoned mutex");
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0]["kind"], "rfq_created");
    }

    #[test]
    fn create_for_unknown_manufacturer_is_not_found() {
        let fixture = Fixture::new();
        let mut request = create_request();
        request.manufacturer_id = "mfg_missing".to_string();

        let error = fixture
            .run(|workflows| workflows.create_rfq(request, Some("key-1")))
            .expect_err("unknown manufacturer must fail");
        assert_eq!(error.http_status(), 404);
        assert!(fixture.private.keys_with_prefix("idem/").is_empty());
    }

    #[test]
    fn create_with_attachments_adds_attachment_event() {
        let fixture = Fixture::new();
        let mut request = create_request();
        request.attachments = vec![AttachmentInput {
            key: "uploads/r/drawing.pdf".to_string(),
            file_name: "drawing.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size_bytes: 2048,
        }];

        let created = fixture
            .run(|workflows| workflows.create_rfq(request, None))
            .expect("create should succeed")
            .into_inner();
        let events = fixture.events(&created.id);
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].body.kind(), "attachment");
        assert_eq!(created.last_event_ts, events[2].ts);
    }

    #[test]
    fn retried_create_replays_the_same_rfq() {
        let fixture = Fixture::new();
        let first = fixture
            .run(|workflows| workflows.create_rfq(create_request(), Some("create-1")))
            .expect("first create should succeed");
        let second = fixture
            .run(|workflows| workflows.create_rfq(create_request(), Some("create-1")))
            .expect("retry should replay");

        assert!(!first.is_replay());
        assert!(second.is_replay());
        assert_eq!(first.into_inner(), second.into_inner());
        let metas = fixture
            .private
            .keys_with_prefix("rfq/")
            .into_iter()
            .filter(|key| key.ends_with("meta.json"))
            .count();
        assert_eq!(metas, 1);

        let mut changed = create_request();
        changed.body = "3 parts".to_string();
        let error = fixture
            .run(|workflows| workflows.create_rfq(changed, Some("create-1")))
            .expect_err("different body must conflict");
        assert_eq!(error, LedgerError::IdempotencyConflict);
    }

    #[test]
    fn system_cannot_post_messages() {
        let fixture = Fixture::new();
        let error = fixture
            .run(|workflows| {
                workflows.post_message(
                    "r_ABCDEF123456",
                    PostMessageRequest {
                        by: EventAuthor::System,
                        body: "hello".to_string(),
                        attachments: Vec::new(),
                    },
                    None,
                )
            })
            .expect_err("system messages are rejected");
        assert_eq!(error.http_status(), 400);
    }

    #[test]
    fn status_after_archive_is_accepted_with_anomaly() {
        let fixture = Fixture::new();
        let created = fixture
            .run(|workflows| workflows.create_rfq(create_request(), None))
            .expect("create should succeed")
            .into_inner();

        let archived = fixture
            .run(|workflows| {
                workflows.post_status(
                    &created.id,
                    PostStatusRequest {
                        by: EventAuthor::Buyer,
                        status: StatusType::Archived,
                        note: None,
                    },
                    None,
                )
            })
            .expect("archive should succeed")
            .into_inner();
        assert_eq!(archived.status, RfqStatus::Archived);
        assert!(archived.anomalies.is_empty());

        let closed = fixture
            .run(|workflows| {
                workflows.post_status(
                    &created.id,
                    PostStatusRequest {
                        by: EventAuthor::Manufacturer,
                        status: StatusType::Closed,
                        note: Some("no capacity".to_string()),
                    },
                    Some("close-1"),
                )
            })
            .expect("close should succeed")
            .into_inner();
        assert_eq!(closed.status, RfqStatus::Closed);
        assert!(closed.anomalies.contains(&LedgerAnomaly::TransitionFromTerminal));
    }

    #[test]
    fn message_with_attachment_returns_message_event() {
        let fixture = Fixture::new();
        let created = fixture
            .run(|workflows| workflows.create_rfq(create_request(), None))
            .expect("create should succeed")
            .into_inner();

        let posted = fixture
            .run(|workflows| {
                workflows.post_message(
                    &created.id,
                    PostMessageRequest {
                        by: EventAuthor::Manufacturer,
                        body: "Quote attached".to_string(),
                        attachments: vec![AttachmentInput {
                            key: "uploads/r/quote.pdf".to_string(),
                            file_name: "quote.pdf".to_string(),
                            content_type: "application/pdf".to_string(),
                            size_bytes: 4096,
                        }],
                    },
                    Some("msg-1"),
                )
            })
            .expect("message should post")
            .into_inner();

        let events = fixture.events(&created.id);
        assert_eq!(events.len(), 4);
        assert_eq!(events[2].id, posted.id);
        assert_eq!(events[3].body.kind(), "attachment");
    }

    #[test]
    fn lagging_metadata_is_reported_as_warning() {
        let fixture = Fixture::new();
        let created = fixture
            .run(|workflows| workflows.create_rfq(create_request(), None))
            .expect("create should succeed")
            .into_inner();
        assert!(created.warnings.is_empty());

        fixture.private.fail_next(
            StoreOperation::Put,
            "meta.json",
            StoreError::PreconditionFailed("meta.json".to_string()),
            3,
        );
        let posted = fixture
            .run(|workflows| {
                workflows.post_message(
                    &created.id,
                    PostMessageRequest {
                        by: EventAuthor::Buyer,
                        body: "Any update?".to_string(),
                        attachments: Vec::new(),
                    },
                    None,
                )
            })
            .expect("contention is a soft failure")
            .into_inner();

        assert_eq!(posted.warnings, vec![ResponseWarning::StorageContention]);
        assert_eq!(fixture.events(&created.id).len(), 3);
    }
}
