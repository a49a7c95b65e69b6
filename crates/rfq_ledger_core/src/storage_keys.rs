use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};

use crate::slicing::SliceKey;

/// Fixed-width, lexically sortable rendering of an event timestamp. Event
/// timestamps are truncated to microseconds before they reach this function.
const EVENT_TS_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFamily {
    Rfq,
    Idempotency,
    Manufacturer,
    CatalogCategory,
    CatalogCategoryState,
    CatalogMembership,
}

impl RecordFamily {
    fn as_str(self) -> &'static str {
        match self {
            Self::Rfq => "rfq",
            Self::Idempotency => "idem",
            Self::Manufacturer => "manufacturer",
            Self::CatalogCategory => "catalog/category",
            Self::CatalogCategoryState => "catalog/category_state",
            Self::CatalogMembership => "catalog/membership",
        }
    }
}

pub fn family_prefix(base_prefix: &str, family: RecordFamily) -> String {
    let trimmed = base_prefix.trim_matches('/');
    if trimmed.is_empty() {
        format!("{}/", family.as_str())
    } else {
        format!("{trimmed}/{}/", family.as_str())
    }
}

pub fn rfq_prefix(base_prefix: &str, rfq_id: &str) -> String {
    format!("{}{rfq_id}/", family_prefix(base_prefix, RecordFamily::Rfq))
}

pub fn rfq_meta_key(base_prefix: &str, rfq_id: &str) -> String {
    format!("{}meta.json", rfq_prefix(base_prefix, rfq_id))
}

pub fn rfq_index_key(base_prefix: &str, rfq_id: &str) -> String {
    format!("{}index.json", rfq_prefix(base_prefix, rfq_id))
}

pub fn rfq_events_prefix(base_prefix: &str, rfq_id: &str) -> String {
    format!("{}events/", rfq_prefix(base_prefix, rfq_id))
}

pub fn event_object_key(
    base_prefix: &str,
    rfq_id: &str,
    ts: DateTime<Utc>,
    event_id: &str,
) -> String {
    format!(
        "{}{}_{event_id}.json",
        rfq_events_prefix(base_prefix, rfq_id),
        ts.format(EVENT_TS_FORMAT),
    )
}

/// Recovers the timestamp embedded in an event key. Returns `None` for keys
/// this layout did not produce.
pub fn event_key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let file_name = key.rsplit('/').next()?;
    let stem = file_name.strip_suffix(".json")?;
    let (ts_segment, event_id) = stem.split_once('_')?;
    if event_id.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(ts_segment, EVENT_TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Markers are keyed by a digest of scope and token so client-chosen tokens
/// never leak into key names and two routes never share a marker.
pub fn idempotency_marker_key(base_prefix: &str, scope: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update(b"\n");
    hasher.update(token.as_bytes());
    format!(
        "{}{:x}.json",
        family_prefix(base_prefix, RecordFamily::Idempotency),
        hasher.finalize()
    )
}

pub fn manufacturers_prefix(base_prefix: &str) -> String {
    family_prefix(base_prefix, RecordFamily::Manufacturer)
}

pub fn manufacturer_object_key(base_prefix: &str, manufacturer_id: &str) -> String {
    format!("{}{manufacturer_id}.json", manufacturers_prefix(base_prefix))
}

pub fn slice_object_key(base_prefix: &str, slice: &SliceKey) -> String {
    match slice {
        SliceKey::Category { category } => format!(
            "{}{category}.json",
            family_prefix(base_prefix, RecordFamily::CatalogCategory)
        ),
        SliceKey::CategoryState { category, state } => format!(
            "{}{category}/{state}.json",
            family_prefix(base_prefix, RecordFamily::CatalogCategoryState)
        ),
    }
}

pub fn membership_object_key(base_prefix: &str, manufacturer_id: &str) -> String {
    format!(
        "{}{manufacturer_id}.json",
        family_prefix(base_prefix, RecordFamily::CatalogMembership)
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 14, 10, 15, 30).unwrap()
            + chrono::Duration::microseconds(123_456)
    }

    #[test]
    fn builds_rfq_keys_with_and_without_prefix() {
        assert_eq!(rfq_meta_key("", "r_ABC"), "rfq/r_ABC/meta.json");
        assert_eq!(
            rfq_index_key("/ledger/", "r_ABC"),
            "ledger/rfq/r_ABC/index.json"
        );
        assert_eq!(
            rfq_events_prefix("ledger", "r_ABC"),
            "ledger/rfq/r_ABC/events/"
        );
    }

    #[test]
    fn builds_event_key_with_sortable_timestamp() {
        let key = event_object_key("", "r_ABC", sample_ts(), "ev_0192");
        assert_eq!(key, "rfq/r_ABC/events/20260214T101530.123456Z_ev_0192.json");
    }

    #[test]
    fn event_keys_sort_like_timestamps() {
        let earlier = event_object_key("", "r_ABC", sample_ts(), "ev_b");
        let later = event_object_key(
            "",
            "r_ABC",
            sample_ts() + chrono::Duration::microseconds(1),
            "ev_a",
        );
        assert!(earlier < later);
    }

    #[test]
    fn recovers_timestamp_from_event_key() {
        let key = event_object_key("ledger", "r_ABC", sample_ts(), "ev_0192");
        assert_eq!(event_key_timestamp(&key), Some(sample_ts()));
        assert_eq!(event_key_timestamp("rfq/r_ABC/events/garbage.json"), None);
        assert_eq!(event_key_timestamp("rfq/r_ABC/meta.json"), None);
    }

    #[test]
    fn marker_keys_are_scoped_digests() {
        let create = idempotency_marker_key("", "create_rfq", "token-1");
        let message = idempotency_marker_key("", "post_message:r_ABC", "token-1");

        assert!(create.starts_with("idem/"));
        assert!(create.ends_with(".json"));
        assert!(!create.contains("token-1"));
        assert_ne!(create, message);
        assert_eq!(create, idempotency_marker_key("", "create_rfq", "token-1"));
    }

    #[test]
    fn builds_catalog_keys() {
        let category = SliceKey::category("cnc-machining");
        let state = SliceKey::category_state("cnc-machining", "CA");

        assert_eq!(
            slice_object_key("", &category),
            "catalog/category/cnc-machining.json"
        );
        assert_eq!(
            slice_object_key("public", &state),
            "public/catalog/category_state/cnc-machining/CA.json"
        );
        assert_eq!(
            membership_object_key("", "mfg_123"),
            "catalog/membership/mfg_123.json"
        );
        assert_eq!(
            manufacturer_object_key("", "mfg_123"),
            "manufacturer/mfg_123.json"
        );
    }
}
