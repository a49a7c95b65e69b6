//! Request/response contracts of the public API and the boundary validation
//! that turns raw requests into normalized ledger inputs.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::ids::{generate_attachment_id, is_valid_manufacturer_id};
use crate::model::{
    AttachmentRef, Contact, EventAuthor, Location, Manufacturer, RfqEvent, RfqStatus, StatusType,
};

pub const MAX_MESSAGE_BODY_CHARS: usize = 8_000;
pub const MAX_ATTACHMENTS_PER_EVENT: usize = 10;
pub const MAX_ATTACHMENT_BYTES: u64 = 15 * 1024 * 1024;
pub const ALLOWED_ATTACHMENT_CONTENT_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/avif",
    "application/pdf",
];
pub const MAX_SUBJECT_CHARS: usize = 200;
pub const MAX_NAME_CHARS: usize = 200;
pub const MAX_FILE_NAME_CHARS: usize = 255;
pub const MAX_TENANT_ID_CHARS: usize = 50;
pub const MAX_NOTE_CHARS: usize = 2_000;
pub const MAX_DESCRIPTION_CHARS: usize = 4_000;
pub const MAX_OBJECT_KEY_CHARS: usize = 1_024;
pub const MAX_SLUG_CHARS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactInput {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentInput {
    pub key: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

impl AttachmentInput {
    pub fn into_attachment_ref(self) -> AttachmentRef {
        AttachmentRef {
            id: generate_attachment_id(),
            file_name: self.file_name,
            content_type: self.content_type,
            size_bytes: self.size_bytes,
            key: self.key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRfqRequest {
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub manufacturer_id: String,
    pub buyer: ContactInput,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedCreateRfq {
    pub tenant_id: Option<String>,
    pub manufacturer_id: String,
    pub buyer: Contact,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<AttachmentInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostMessageRequest {
    pub by: EventAuthor,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub by: EventAuthor,
    pub body: String,
    pub attachments: Vec<AttachmentInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostStatusRequest {
    pub by: EventAuthor,
    pub status: StatusType,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertManufacturerRequest {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
}

/// Work item for the publisher runtime, either invoked directly or carried
/// in SQS record bodies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishRequest {
    #[serde(default)]
    pub manufacturer_ids: Vec<String>,
    #[serde(default)]
    pub reconcile_rfq_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRfqResponse {
    pub id: String,
    pub last_event_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ResponseWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventCommittedResponse {
    pub id: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ResponseWarning>,
}

/// Soft failures of a request that still committed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseWarning {
    /// Meta or index still lag behind the committed events. Event listings
    /// are unaffected; a reconcile brings the caches up to date.
    StorageContention,
}

/// Conditions the ledger accepted but flags, e.g. a close after an archive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAnomaly {
    EventAfterTerminal,
    TransitionFromTerminal,
    SupersededStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPostedResponse {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub status: RfqStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<LedgerAnomaly>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ResponseWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventsPageResponse {
    pub items: Vec<RfqEvent>,
    pub next_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManufacturerWriteResponse {
    pub id: String,
    pub rebuilt_slices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileResponse {
    pub rfq_id: String,
    pub count: u64,
    pub last_event_ts: Option<DateTime<Utc>>,
    pub status: RfqStatus,
    pub corrected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn normalize_create_rfq(
    payload: CreateRfqRequest,
) -> Result<NormalizedCreateRfq, ValidationError> {
    let tenant_id = match payload.tenant_id {
        Some(tenant_id) => Some(validate_tenant_id(&tenant_id)?),
        None => None,
    };

    let manufacturer_id = payload.manufacturer_id.trim().to_string();
    if !is_valid_manufacturer_id(&manufacturer_id) {
        return Err(ValidationError::new(
            "manufacturer_id must match mfg_[A-Za-z0-9_-]+",
        ));
    }

    let buyer = normalize_contact(payload.buyer, "buyer")?;
    let subject = required_text(&payload.subject, "subject", MAX_SUBJECT_CHARS)?;
    let body = validate_message_body(&payload.body)?;
    let attachments = validate_attachments(payload.attachments)?;

    Ok(NormalizedCreateRfq {
        tenant_id,
        manufacturer_id,
        buyer,
        subject,
        body,
        attachments,
    })
}

pub fn normalize_message(
    payload: PostMessageRequest,
) -> Result<NormalizedMessage, ValidationError> {
    if payload.by == EventAuthor::System {
        return Err(ValidationError::new(
            "messages must be authored by buyer or manufacturer",
        ));
    }

    Ok(NormalizedMessage {
        by: payload.by,
        body: validate_message_body(&payload.body)?,
        attachments: validate_attachments(payload.attachments)?,
    })
}

pub fn normalize_status(payload: PostStatusRequest) -> Result<PostStatusRequest, ValidationError> {
    if payload.status == StatusType::RfqCreated {
        return Err(ValidationError::new(
            "rfq_created is recorded by the ledger and cannot be posted",
        ));
    }

    let note = match payload.note {
        Some(note) if note.trim().is_empty() => None,
        Some(note) => Some(required_text(&note, "note", MAX_NOTE_CHARS)?),
        None => None,
    };

    Ok(PostStatusRequest {
        by: payload.by,
        status: payload.status,
        note,
    })
}

pub fn normalize_manufacturer(
    payload: UpsertManufacturerRequest,
    updated_at: DateTime<Utc>,
) -> Result<Manufacturer, ValidationError> {
    let id = payload.id.trim().to_string();
    if !is_valid_manufacturer_id(&id) {
        return Err(ValidationError::new("id must match mfg_[A-Za-z0-9_-]+"));
    }

    let tenant_id = validate_tenant_id(&payload.tenant_id)?;
    let name = required_text(&payload.name, "name", MAX_NAME_CHARS)?;
    let description = match payload.description {
        Some(description) if description.trim().is_empty() => None,
        Some(description) => Some(required_text(
            &description,
            "description",
            MAX_DESCRIPTION_CHARS,
        )?),
        None => None,
    };

    let mut categories = BTreeSet::new();
    for raw in &payload.categories {
        categories.insert(normalize_category(raw)?);
    }

    let mut capabilities: Vec<String> = Vec::new();
    for raw in &payload.capabilities {
        let capability = raw.trim();
        if capability.is_empty() || capabilities.iter().any(|seen| seen == capability) {
            continue;
        }
        capabilities.push(capability.to_string());
    }

    let contact_email = match payload.contact_email {
        Some(email) if email.trim().is_empty() => None,
        Some(email) => Some(validate_email(&email, "contact_email")?),
        None => None,
    };

    Ok(Manufacturer {
        id,
        tenant_id,
        name,
        description,
        location: normalize_location(payload.location)?,
        categories,
        capabilities,
        contact_email,
        updated_at,
    })
}

pub fn validate_message_body(raw: &str) -> Result<String, ValidationError> {
    let body = raw.trim();
    if body.is_empty() {
        return Err(ValidationError::new("body cannot be empty"));
    }
    if body.chars().count() > MAX_MESSAGE_BODY_CHARS {
        return Err(ValidationError::new(format!(
            "body exceeds {MAX_MESSAGE_BODY_CHARS} characters"
        )));
    }
    if looks_like_markup(body) {
        return Err(ValidationError::new("body cannot contain HTML tags"));
    }
    Ok(body.to_string())
}

pub fn validate_attachments(
    attachments: Vec<AttachmentInput>,
) -> Result<Vec<AttachmentInput>, ValidationError> {
    if attachments.len() > MAX_ATTACHMENTS_PER_EVENT {
        return Err(ValidationError::new(format!(
            "at most {MAX_ATTACHMENTS_PER_EVENT} attachments are allowed per event"
        )));
    }

    attachments
        .into_iter()
        .map(|attachment| {
            let file_name = required_text(&attachment.file_name, "file_name", MAX_FILE_NAME_CHARS)?;
            if !ALLOWED_ATTACHMENT_CONTENT_TYPES.contains(&attachment.content_type.as_str()) {
                return Err(ValidationError::new(format!(
                    "content type '{}' is not allowed",
                    attachment.content_type
                )));
            }
            if attachment.size_bytes == 0 || attachment.size_bytes > MAX_ATTACHMENT_BYTES {
                return Err(ValidationError::new(format!(
                    "attachment '{file_name}' must be 1 to {MAX_ATTACHMENT_BYTES} bytes"
                )));
            }
            validate_object_key(&attachment.key)?;
            Ok(AttachmentInput {
                key: attachment.key,
                file_name,
                content_type: attachment.content_type,
                size_bytes: attachment.size_bytes,
            })
        })
        .collect()
}

pub fn request_fingerprint(request: &impl Serialize) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    hasher.update(stable_contract_json(request)?);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn stable_contract_json(value: impl Serialize) -> Result<String, serde_json::Error> {
    serde_json::to_string(&value)
}

fn validate_tenant_id(raw: &str) -> Result<String, ValidationError> {
    let tenant_id = raw.trim();
    if tenant_id.is_empty() || tenant_id.chars().count() > MAX_TENANT_ID_CHARS {
        return Err(ValidationError::new(format!(
            "tenant_id must be 1-{MAX_TENANT_ID_CHARS} characters"
        )));
    }
    if !tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::new(
            "tenant_id may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(tenant_id.to_string())
}

fn normalize_contact(contact: ContactInput, field: &str) -> Result<Contact, ValidationError> {
    let email = validate_email(&contact.email, &format!("{field}.email"))?;
    let name = match contact.name {
        Some(name) if name.trim().is_empty() => None,
        Some(name) => Some(required_text(&name, &format!("{field}.name"), MAX_NAME_CHARS)?),
        None => None,
    };
    Ok(Contact { email, name })
}

fn validate_email(raw: &str, field: &str) -> Result<String, ValidationError> {
    let email = raw.trim();
    let valid = email.len() <= 254
        && !email.chars().any(char::is_whitespace)
        && email.split_once('@').is_some_and(|(local, domain)| {
            !local.is_empty()
                && !domain.contains('@')
                && domain
                    .split_once('.')
                    .is_some_and(|(head, tail)| !head.is_empty() && !tail.is_empty())
        });
    if !valid {
        return Err(ValidationError::new(format!(
            "{field} must be a valid email address"
        )));
    }
    Ok(email.to_string())
}

fn required_text(raw: &str, field: &str, max_chars: usize) -> Result<String, ValidationError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ValidationError::new(format!("{field} cannot be empty")));
    }
    if text.chars().count() > max_chars {
        return Err(ValidationError::new(format!(
            "{field} exceeds {max_chars} characters"
        )));
    }
    Ok(text.to_string())
}

fn validate_object_key(key: &str) -> Result<(), ValidationError> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_CHARS
        || key.starts_with('/')
        || key.contains("//")
        || key.split('/').any(|segment| segment == "..");
    if invalid {
        return Err(ValidationError::new(format!(
            "attachment key '{key}' is not a valid object key"
        )));
    }
    Ok(())
}

fn normalize_category(raw: &str) -> Result<String, ValidationError> {
    let slug: String = raw
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '_' { '-' } else { c })
        .collect();
    let valid = !slug.is_empty()
        && slug.len() <= MAX_SLUG_CHARS
        && slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(ValidationError::new(format!(
            "category '{raw}' must be a slug of letters, digits and '-'"
        )));
    }
    Ok(slug)
}

fn normalize_location(location: Location) -> Result<Location, ValidationError> {
    let state = match location.state.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(state) => {
            let state = state.to_ascii_uppercase();
            let valid = state.len() <= MAX_SLUG_CHARS
                && state.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
            if !valid {
                return Err(ValidationError::new(format!(
                    "location.state '{state}' may only contain letters, digits and '-'"
                )));
            }
            Some(state)
        }
    };

    Ok(Location {
        city: trimmed_optional(location.city),
        state,
        country: trimmed_optional(location.country),
    })
}

fn trimmed_optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `<` directly followed by a letter, `/` or `!` with a closing `>` later on.
fn looks_like_markup(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.iter().enumerate().any(|(index, byte)| {
        *byte == b'<'
            && bytes
                .get(index + 1)
                .is_some_and(|next| next.is_ascii_alphabetic() || *next == b'/' || *next == b'!')
            && bytes[index + 1..].contains(&b'>')
    })
}
