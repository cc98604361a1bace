//! Click-stream event model.
//!
//! A [`RawEvent`] is what the source connector hands us; an
//! [`EnrichedEvent`] is what the event store keeps once the session start
//! has been resolved and reference lookups have been applied. All times are
//! microseconds since the Unix epoch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Microseconds in one second.
pub const MICROS_PER_SEC: i64 = 1_000_000;

/// Microseconds in one day, the default fraud window.
pub const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SEC;

/// Enumerated event-type code.
///
/// Only a handful of codes carry meaning for fraud detection; every other
/// integer is a valid domain-specific kind and flows through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKind(pub i64);

impl EventKind {
    /// Ad request, logged before an ad is assigned.
    pub const REQUEST: Self = Self(1);
    /// Click on a served ad.
    pub const CLICK: Self = Self(2);
    /// Fulfillment of a click; disqualifies a group from the fraud pattern.
    pub const COMPLETION: Self = Self(9);

    /// Raw integer code.
    #[must_use]
    pub const fn code(self) -> i64 {
        self.0
    }

    /// Short name for well-known kinds.
    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("request"),
            2 => Some("click"),
            9 => Some("completion"),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({name})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

/// One raw click-stream event, as read from a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_time_us: i64,
    /// Absent for ad-request events that precede ad assignment.
    pub ad_id: Option<i64>,
    pub session_id: String,
    pub viewer_id: String,
    pub event_type: EventKind,
    pub channel_id: i64,
    pub source_file_name: String,
    pub source_file_timestamp_us: i64,
}

/// A committed event with its resolved session start and enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub event_id: i64,
    #[serde(flatten)]
    pub raw: RawEvent,
    pub session_start_us: i64,
    pub campaign_id: Option<i64>,
    pub advertiser_id: Option<i64>,
    pub content_distributor_id: Option<i64>,
}

impl EnrichedEvent {
    /// Aggregation key of this row.
    #[must_use]
    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            session_start_us: self.session_start_us,
            session_id: self.raw.session_id.clone(),
            ad_id: self.raw.ad_id,
        }
    }
}

/// Grouping key for per-session aggregates.
///
/// `ad_id = None` is an ordinary group value: every ad-less row of a session
/// start lands in the same group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub session_start_us: i64,
    pub session_id: String,
    pub ad_id: Option<i64>,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ad = self
            .ad_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        write!(
            f,
            "{}@{}/ad={ad}",
            self.session_id,
            format_micros(self.session_start_us)
        )
    }
}

/// Convert a UTC timestamp to epoch microseconds.
#[must_use]
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Convert epoch microseconds back to a UTC timestamp, if representable.
#[must_use]
pub fn from_micros(us: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(us)
}

/// Render epoch microseconds as RFC 3339, falling back to the raw number.
#[must_use]
pub fn format_micros(us: i64) -> String {
    from_micros(us).map_or_else(
        || us.to_string(),
        |ts| ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
    )
}
