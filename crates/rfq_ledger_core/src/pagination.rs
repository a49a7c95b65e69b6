//! The `since` poll feed over an RFQ's event set.
//!
//! The cursor is a bare timestamp and the filter is strictly `ts > since`.
//! A page therefore never ends in the middle of a group of events that share
//! one timestamp: the rest of such a group would be unreachable from the
//! returned cursor.

use chrono::{DateTime, Utc};

use crate::contract::ValidationError;
use crate::model::RfqEvent;

pub const DEFAULT_EVENT_PAGE_LIMIT: usize = 50;
pub const MAX_EVENT_PAGE_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPage {
    pub items: Vec<RfqEvent>,
    /// Timestamp of the last returned event; the incoming cursor when the
    /// page is empty.
    pub next_since: Option<DateTime<Utc>>,
}

pub fn normalize_limit(limit: Option<usize>) -> Result<usize, ValidationError> {
    match limit {
        None => Ok(DEFAULT_EVENT_PAGE_LIMIT),
        Some(0) => Err(ValidationError::new("limit must be a positive integer")),
        Some(value) => Ok(value.min(MAX_EVENT_PAGE_LIMIT)),
    }
}

pub fn parse_limit(raw: Option<&str>) -> Result<usize, ValidationError> {
    let parsed = match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => None,
        Some(value) => Some(
            value
                .parse::<usize>()
                .map_err(|_| ValidationError::new("limit must be a positive integer"))?,
        ),
    };
    normalize_limit(parsed)
}

pub fn parse_since(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|_| ValidationError::new("since must be an RFC 3339 timestamp")),
    }
}

/// Sorts by `(ts, id)`, drops duplicate ids, keeps events after `since` and
/// truncates to `limit` without splitting a timestamp group.
pub fn paginate(
    mut events: Vec<RfqEvent>,
    since: Option<DateTime<Utc>>,
    limit: usize,
) -> EventPage {
    events.sort_by(|left, right| (left.ts, &left.id).cmp(&(right.ts, &right.id)));
    events.dedup_by(|left, right| left.id == right.id);
    if let Some(since) = since {
        events.retain(|event| event.ts > since);
    }

    let cut = page_end(&events, limit.max(1));
    events.truncate(cut);

    let next_since = events.last().map(|event| event.ts).or(since);
    EventPage {
        items: events,
        next_since,
    }
}

fn page_end(events: &[RfqEvent], limit: usize) -> usize {
    if events.len() <= limit {
        return events.len();
    }

    let boundary_ts = events[limit - 1].ts;
    if events[limit].ts != boundary_ts {
        return limit;
    }

    let group_start = events[..limit]
        .iter()
        .position(|event| event.ts == boundary_ts)
        .unwrap_or(0);
    if group_start > 0 {
        return group_start;
    }

    // The whole page is one timestamp group: overshoot the limit instead.
    events
        .iter()
        .position(|event| event.ts != boundary_ts)
        .unwrap_or(events.len())
}
