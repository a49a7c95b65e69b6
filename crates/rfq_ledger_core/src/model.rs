//! Stored records: RFQ meta/index, the event union, manufacturers, catalog
//! slices and idempotency markers. Every type here is serialized as JSON into
//! the object store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::slicing::SliceKey;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RfqStatus {
    Open,
    Archived,
    Closed,
}

impl RfqStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Archived | Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Archived => "archived",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Buyer,
    Manufacturer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub role: ParticipantRole,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Reference to an uploaded file. `key` is the private object key handed out
/// by the upload issuer; the ledger never issues upload URLs itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentRef {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub key: String,
}

/// Position of an event in its RFQ's total order. Field order matters: the
/// derived `Ord` compares `ts` first and breaks ties on `id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventPosition {
    pub ts: DateTime<Utc>,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RfqMeta {
    pub id: String,
    pub tenant_id: String,
    pub manufacturer_id: String,
    pub buyer: Contact,
    pub subject: String,
    pub status: RfqStatus,
    pub created_at: DateTime<Utc>,
    /// `None` until the first event commits.
    #[serde(default)]
    pub last_event_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_event_id: Option<String>,
    /// Status event that set `status`. Tracked apart from the last event so
    /// a late cache update for an older status never overrides a newer one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_event: Option<EventPosition>,
    pub participants: Vec<Participant>,
}

impl RfqMeta {
    pub fn last_event_position(&self) -> Option<EventPosition> {
        match (&self.last_event_ts, &self.last_event_id) {
            (Some(ts), Some(id)) => Some(EventPosition {
                ts: *ts,
                id: id.clone(),
            }),
            _ => None,
        }
    }
}

/// Running side index. An accelerator only: it can always be recomputed from
/// the event listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RfqIndex {
    pub count: u64,
    #[serde(default)]
    pub last_event_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_event_id: Option<String>,
    /// Ids of the most recently counted events, oldest first. A retried index
    /// write finds its event here even after newer events were counted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_event_ids: Vec<String>,
}

impl RfqIndex {
    /// Compares what readers see, ignoring the order of the recent-id window.
    pub fn same_totals(&self, other: &RfqIndex) -> bool {
        self.count == other.count
            && self.last_event_ts == other.last_event_ts
            && self.last_event_id == other.last_event_id
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventAuthor {
    Buyer,
    Manufacturer,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    RfqCreated,
    VendorViewed,
    VendorReplied,
    BuyerViewed,
    Closed,
    Archived,
}

impl StatusType {
    /// The RFQ status this marker moves the request into, if any.
    pub fn resulting_status(self) -> Option<RfqStatus> {
        match self {
            Self::Closed => Some(RfqStatus::Closed),
            Self::Archived => Some(RfqStatus::Archived),
            Self::RfqCreated | Self::VendorViewed | Self::VendorReplied | Self::BuyerViewed => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Message {
        body: String,
    },
    Status {
        status: StatusType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Attachment {
        attachments: Vec<AttachmentRef>,
    },
}

impl EventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Status { .. } => "status",
            Self::Attachment { .. } => "attachment",
        }
    }
}

/// What a caller hands to the ledger: everything except the server-assigned
/// `id` and `ts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub by: EventAuthor,
    pub body: EventBody,
}

impl EventDraft {
    pub fn message(by: EventAuthor, body: impl Into<String>) -> Self {
        Self {
            by,
            body: EventBody::Message { body: body.into() },
        }
    }

    pub fn status(by: EventAuthor, status: StatusType, note: Option<String>) -> Self {
        Self {
            by,
            body: EventBody::Status { status, note },
        }
    }

    pub fn attachments(by: EventAuthor, attachments: Vec<AttachmentRef>) -> Self {
        Self {
            by,
            body: EventBody::Attachment { attachments },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RfqEvent {
    pub id: String,
    pub rfq_id: String,
    pub ts: DateTime<Utc>,
    pub by: EventAuthor,
    #[serde(flatten)]
    pub body: EventBody,
}

impl RfqEvent {
    pub fn position(&self) -> EventPosition {
        EventPosition {
            ts: self.ts,
            id: self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manufacturer {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Manufacturer {
    pub fn state(&self) -> Option<&str> {
        self.location.state.as_deref().filter(|state| !state.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManufacturerSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub categories: BTreeSet<String>,
    pub capabilities: Vec<String>,
}

impl From<&Manufacturer> for ManufacturerSummary {
    fn from(manufacturer: &Manufacturer) -> Self {
        Self {
            id: manufacturer.id.clone(),
            name: manufacturer.name.clone(),
            city: manufacturer.location.city.clone(),
            state: manufacturer.location.state.clone(),
            categories: manufacturer.categories.clone(),
            capabilities: manufacturer.capabilities.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SliceDimension {
    Category,
    CategoryState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogSlice {
    pub dimension: SliceDimension,
    pub key: String,
    /// Latest `updated_at` among the members; the Unix epoch for an empty
    /// slice. Derived from data so unchanged membership yields unchanged bytes.
    pub generated_at: DateTime<Utc>,
    pub items: Vec<ManufacturerSummary>,
}

/// The slices a manufacturer was last published into. Lets a rebuild find the
/// slices a manufacturer is leaving, not just the ones it belongs to now.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SliceMembership {
    pub manufacturer_id: String,
    pub slices: BTreeSet<SliceKey>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MarkerState {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyMarker {
    pub request_hash: String,
    pub state: MarkerState,
    /// Unique per claiming call, so a claim can recognise its own write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    pub ts: DateTime<Utc>,
}
