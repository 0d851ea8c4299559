//! Canonical timestamps and normalization of the backend's mixed encodings.
//!
//! The backend reports times either as ISO-8601 strings (with or without an
//! offset) or as a Java `LocalDateTime` serialized to a numeric array
//! `[year, month, day, hour, minute, second, nanos]`. Everything is folded
//! into [`Timestamp`], epoch milliseconds in UTC.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

const NANOS_PER_MILLI: i64 = 1_000_000;

const LOCAL_DATE_TIME: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute][optional [:[second][optional [.[subsecond]]]]]"
);

const OFFSET_DATE_TIME: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute][optional [:[second][optional [.[subsecond]]]]][offset_hour sign:mandatory]:[offset_minute]"
);

/// A point in time as epoch milliseconds. Only meaningful for comparison;
/// values from different sources are not assumed to be monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc()).unwrap_or(Self(0))
    }

    /// Returns `None` when the instant does not fit in i64 milliseconds.
    pub fn from_datetime(dt: OffsetDateTime) -> Option<Self> {
        i64::try_from(dt.unix_timestamp_nanos() / i128::from(NANOS_PER_MILLI))
            .ok()
            .map(Self)
    }

    pub fn to_datetime(self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * i128::from(NANOS_PER_MILLI))
            .ok()
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        let ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(ms))
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        let ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(ms))
    }
}

/// A timestamp exactly as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Text(String),
    Parts(Vec<f64>),
}

/// Parse a backend timestamp. Never panics and never invents a time: any
/// input that cannot be read exactly yields `None`, and the caller decides
/// what fallback to use.
pub fn normalize(input: Option<&RawTimestamp>) -> Option<Timestamp> {
    match input? {
        RawTimestamp::Text(s) => parse_text(s),
        RawTimestamp::Parts(parts) => parse_parts(parts),
    }
}

/// RFC 3339 first, then the looser ISO-8601 forms the backend emits: seconds
/// may be dropped (`2025-07-11T09:23`), and a missing offset means UTC.
fn parse_text(s: &str) -> Option<Timestamp> {
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Timestamp::from_datetime(dt);
    }
    if let Some(utc) = s.strip_suffix('Z').or_else(|| s.strip_suffix('z')) {
        let local = PrimitiveDateTime::parse(utc, LOCAL_DATE_TIME).ok()?;
        return Timestamp::from_datetime(local.assume_utc());
    }
    if let Ok(dt) = OffsetDateTime::parse(s, OFFSET_DATE_TIME) {
        return Timestamp::from_datetime(dt);
    }
    let local = PrimitiveDateTime::parse(s, LOCAL_DATE_TIME).ok()?;
    Timestamp::from_datetime(local.assume_utc())
}

/// `[year, month(1-12), day, hour?, minute?, second?, nanos?]`. Omitted
/// trailing components are zero.
fn parse_parts(parts: &[f64]) -> Option<Timestamp> {
    if !(3..=7).contains(&parts.len()) {
        return None;
    }

    let mut fields = [0i64; 7];
    for (slot, &v) in fields.iter_mut().zip(parts) {
        if !v.is_finite() || v.fract() != 0.0 {
            return None;
        }
        *slot = v as i64;
    }
    let [year, month, day, hour, minute, second, nanos] = fields;

    if !(0..1_000_000_000).contains(&nanos) {
        return None;
    }

    let month = Month::try_from(u8::try_from(month).ok()?).ok()?;
    let date =
        Date::from_calendar_date(i32::try_from(year).ok()?, month, u8::try_from(day).ok()?).ok()?;
    let time = Time::from_hms_milli(
        u8::try_from(hour).ok()?,
        u8::try_from(minute).ok()?,
        u8::try_from(second).ok()?,
        u16::try_from(nanos / NANOS_PER_MILLI).ok()?,
    )
    .ok()?;

    Timestamp::from_datetime(PrimitiveDateTime::new(date, time).assume_utc())
}

/// Render `YYYY-MM-DDTHH:MM:SS` in UTC with no offset or fraction, the shape
/// the control endpoint expects for `updatedAt`.
pub fn format_local(ts: Timestamp) -> String {
    ts.to_datetime()
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .format(format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

// ===========================================================================
// Tests
// ===========================================================================
