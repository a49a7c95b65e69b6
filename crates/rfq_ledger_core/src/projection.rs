//! Derivation of the meta and index caches from committed events.
//!
//! Both caches only ever move forward in `(ts, id)` order, so applying the
//! same event twice, or applying events out of order, converges on the value
//! a full replay produces.

use crate::contract::LedgerAnomaly;
use crate::model::{EventBody, EventPosition, RfqEvent, RfqIndex, RfqMeta, RfqStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaChange {
    pub changed: bool,
    pub anomalies: Vec<LedgerAnomaly>,
}

/// Anomalies of appending `event` to an RFQ currently in `status`.
pub fn append_anomalies(status: RfqStatus, event: &RfqEvent) -> Vec<LedgerAnomaly> {
    if !status.is_terminal() {
        return Vec::new();
    }

    let mut anomalies = vec![LedgerAnomaly::EventAfterTerminal];
    if let EventBody::Status { status: marker, .. } = &event.body {
        if marker.resulting_status().is_some() {
            anomalies.push(LedgerAnomaly::TransitionFromTerminal);
        }
    }
    anomalies
}

pub fn apply_event_to_meta(meta: &mut RfqMeta, event: &RfqEvent) -> MetaChange {
    let position = event.position();
    let mut change = MetaChange::default();

    if meta.last_event_position().map_or(true, |last| position > last) {
        meta.last_event_ts = Some(position.ts);
        meta.last_event_id = Some(position.id.clone());
        change.changed = true;
    }

    if let EventBody::Status { status, .. } = &event.body {
        if let Some(next) = status.resulting_status() {
            if meta.status_event.as_ref().map_or(true, |current| position > *current) {
                meta.status = next;
                meta.status_event = Some(position);
                change.changed = true;
            } else if meta.status_event.as_ref() != Some(&position) {
                change.anomalies.push(LedgerAnomaly::SupersededStatus);
            }
        }
    }

    change
}

/// How many recently counted event ids the index remembers.
pub const RECENT_EVENT_IDS: usize = 32;

/// Returns `false` when the index already accounts for `event`.
pub fn apply_event_to_index(index: &mut RfqIndex, event: &RfqEvent) -> bool {
    let already_counted = index.last_event_id.as_deref() == Some(event.id.as_str())
        || index.recent_event_ids.iter().any(|id| id == &event.id);
    if already_counted {
        return false;
    }

    index.count += 1;
    remember_event(index, &event.id);
    let position = event.position();
    let current = match (&index.last_event_ts, &index.last_event_id) {
        (Some(ts), Some(id)) => Some(EventPosition {
            ts: *ts,
            id: id.clone(),
        }),
        _ => None,
    };
    if current.map_or(true, |current| position > current) {
        index.last_event_ts = Some(position.ts);
        index.last_event_id = Some(position.id);
    }
    true
}

fn remember_event(index: &mut RfqIndex, event_id: &str) {
    index.recent_event_ids.push(event_id.to_string());
    if index.recent_event_ids.len() > RECENT_EVENT_IDS {
        let excess = index.recent_event_ids.len() - RECENT_EVENT_IDS;
        index.recent_event_ids.drain(..excess);
    }
}

/// Full replay over a complete event set, in any order.
pub fn replay(meta: &RfqMeta, events: &[RfqEvent]) -> (RfqMeta, RfqIndex) {
    let mut sorted: Vec<&RfqEvent> = events.iter().collect();
    sorted.sort_by(|left, right| (left.ts, &left.id).cmp(&(right.ts, &right.id)));
    sorted.dedup_by(|left, right| left.id == right.id);

    let mut rebuilt = meta.clone();
    rebuilt.status = RfqStatus::Open;
    rebuilt.status_event = None;
    rebuilt.last_event_ts = None;
    rebuilt.last_event_id = None;

    let mut index = RfqIndex::default();
    for event in sorted {
        apply_event_to_meta(&mut rebuilt, event);
        index.count += 1;
        index.last_event_ts = Some(event.ts);
        index.last_event_id = Some(event.id.clone());
        remember_event(&mut index, &event.id);
    }

    (rebuilt, index)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::*;
    use crate::model::{Contact, EventAuthor, StatusType};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 14, 10, 0, 0).unwrap()
    }

    fn meta() -> RfqMeta {
        RfqMeta {
            id: "r_ABC".to_string(),
            tenant_id: "tenant-a".to_string(),
            manufacturer_id: "mfg_123".to_string(),
            buyer: Contact {
                email: "a@b.com".to_string(),
                name: None,
            },
            subject: "CNC prototype".to_string(),
            status: RfqStatus::Open,
            created_at: base(),
            last_event_ts: None,
            last_event_id: None,
            status_event: None,
            participants: Vec::new(),
        }
    }

    fn status_event(id: &str, micros: i64, status: StatusType) -> RfqEvent {
        RfqEvent {
            id: id.to_string(),
            rfq_id: "r_ABC".to_string(),
            ts: base() + Duration::microseconds(micros),
            by: EventAuthor::Buyer,
            body: EventBody::Status { status, note: None },
        }
    }

    fn message_event(id: &str, micros: i64) -> RfqEvent {
        RfqEvent {
            id: id.to_string(),
            rfq_id: "r_ABC".to_string(),
            ts: base() + Duration::microseconds(micros),
            by: EventAuthor::Manufacturer,
            body: EventBody::Message {
                body: "quote attached".to_string(),
            },
        }
    }

    #[test]
    fn late_status_update_still_applies_after_newer_message() {
        let mut meta = meta();
        apply_event_to_meta(&mut meta, &message_event("ev_2", 2));
        let change = apply_event_to_meta(&mut meta, &status_event("ev_1", 1, StatusType::Closed));

        assert!(change.changed);
        assert_eq!(meta.status, RfqStatus::Closed);
        assert_eq!(meta.last_event_id.as_deref(), Some("ev_2"));
    }

    #[test]
    fn older_status_never_overrides_newer_one() {
        let mut meta = meta();
        apply_event_to_meta(&mut meta, &status_event("ev_2", 2, StatusType::Archived));
        let change = apply_event_to_meta(&mut meta, &status_event("ev_1", 1, StatusType::Closed));

        assert_eq!(meta.status, RfqStatus::Archived);
        assert_eq!(change.anomalies, vec![LedgerAnomaly::SupersededStatus]);
    }

    #[test]
    fn reapplying_an_event_is_a_no_op() {
        let mut meta = meta();
        let event = status_event("ev_1", 1, StatusType::Closed);
        assert!(apply_event_to_meta(&mut meta, &event).changed);
        let again = apply_event_to_meta(&mut meta, &event);
        assert!(!again.changed);
        assert!(again.anomalies.is_empty());

        let mut index = RfqIndex::default();
        assert!(apply_event_to_index(&mut index, &event));
        assert!(!apply_event_to_index(&mut index, &event));
        assert_eq!(index.count, 1);
    }

    #[test]
    fn retried_index_write_is_not_counted_twice_after_newer_event() {
        let first = message_event("ev_1", 1);
        let second = message_event("ev_2", 2);

        let mut index = RfqIndex::default();
        assert!(apply_event_to_index(&mut index, &first));
        assert!(apply_event_to_index(&mut index, &second));
        assert!(!apply_event_to_index(&mut index, &first));

        assert_eq!(index.count, 2);
        assert_eq!(index.last_event_id.as_deref(), Some("ev_2"));
    }

    #[test]
    fn late_index_update_for_older_event_is_still_counted() {
        let mut index = RfqIndex::default();
        assert!(apply_event_to_index(&mut index, &message_event("ev_2", 2)));
        assert!(apply_event_to_index(&mut index, &message_event("ev_1", 1)));

        assert_eq!(index.count, 2);
        assert_eq!(index.last_event_id.as_deref(), Some("ev_2"));
    }

    #[test]
    fn recent_event_window_is_bounded() {
        let mut index = RfqIndex::default();
        for micros in 0..(RECENT_EVENT_IDS as i64 + 5) {
            apply_event_to_index(&mut index, &message_event(&format!("ev_{micros:03}"), micros));
        }

        assert_eq!(index.recent_event_ids.len(), RECENT_EVENT_IDS);
        assert_eq!(
            index.recent_event_ids.first().map(String::as_str),
            Some("ev_005")
        );
        assert_eq!(index.count, RECENT_EVENT_IDS as u64 + 5);
    }

    #[test]
    fn flags_appends_after_terminal_status() {
        let close = status_event("ev_3", 3, StatusType::Closed);
        assert_eq!(
            append_anomalies(RfqStatus::Archived, &close),
            vec![
                LedgerAnomaly::EventAfterTerminal,
                LedgerAnomaly::TransitionFromTerminal
            ]
        );
        assert_eq!(
            append_anomalies(RfqStatus::Closed, &message_event("ev_4", 4)),
            vec![LedgerAnomaly::EventAfterTerminal]
        );
        assert!(append_anomalies(RfqStatus::Open, &close).is_empty());
    }

    #[test]
    fn replay_matches_latest_event_and_status() {
        let events = vec![
            message_event("ev_3", 3),
            status_event("ev_1", 1, StatusType::RfqCreated),
            status_event("ev_2", 2, StatusType::Closed),
        ];

        let (rebuilt, index) = replay(&meta(), &events);
        assert_eq!(index.count, 3);
        assert_eq!(index.last_event_id.as_deref(), Some("ev_3"));
        assert_eq!(
            rebuilt.last_event_ts,
            Some(base() + Duration::microseconds(3))
        );
        assert_eq!(rebuilt.status, RfqStatus::Closed);
    }
}
