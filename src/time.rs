//! Modification-time handling.
//!
//! Blob properties carry a timestamp that is usually UTC-aware but may be
//! naive.  [`convert_modified_time`] applies the display policy: aware
//! times are converted into the configured zone, naive times are taken to
//! already be in that zone.

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use std::str::FromStr;

/// The zone modification times are displayed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayTimeZone {
    Utc,
    /// The process's local zone.
    Local,
    Fixed(FixedOffset),
}

impl FromStr for DisplayTimeZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("utc") || s == "Z" || s.eq_ignore_ascii_case("etc/utc") {
            return Ok(DisplayTimeZone::Utc);
        }
        if s.eq_ignore_ascii_case("local") {
            return Ok(DisplayTimeZone::Local);
        }
        parse_offset(s)
            .map(DisplayTimeZone::Fixed)
            .ok_or_else(|| format!("expected UTC, local or an offset like +02:00, got '{s}'"))
    }
}

/// Parse `+HH:MM`, `-HH:MM`, `+HHMM` or `+HH`.
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

impl DisplayTimeZone {
    /// Convert an aware time into this zone.
    pub fn convert(&self, t: &DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        match self {
            DisplayTimeZone::Utc => t.with_timezone(&Utc).fixed_offset(),
            DisplayTimeZone::Local => t.with_timezone(&Local).fixed_offset(),
            DisplayTimeZone::Fixed(offset) => t.with_timezone(offset),
        }
    }

    /// Attach this zone to a naive wall-clock time.
    ///
    /// Times skipped by a DST transition are read as UTC.
    pub fn localize(&self, t: &NaiveDateTime) -> DateTime<FixedOffset> {
        match self {
            DisplayTimeZone::Utc => Utc.from_utc_datetime(t).fixed_offset(),
            DisplayTimeZone::Local => Local
                .from_local_datetime(t)
                .earliest()
                .map(|dt| dt.fixed_offset())
                .unwrap_or_else(|| Utc.from_utc_datetime(t).fixed_offset()),
            DisplayTimeZone::Fixed(offset) => offset
                .from_local_datetime(t)
                .single()
                .unwrap_or_else(|| offset.from_utc_datetime(t)),
        }
    }
}

/// A point in time that may or may not carry a UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

impl Timestamp {
    pub fn is_aware(&self) -> bool {
        matches!(self, Timestamp::Aware(_))
    }

    /// Wall-clock time in `tz`; naive values are returned as they are.
    pub fn to_naive(&self, tz: &DisplayTimeZone) -> NaiveDateTime {
        match self {
            Timestamp::Aware(t) => tz.convert(t).naive_local(),
            Timestamp::Naive(t) => *t,
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(t: DateTime<Utc>) -> Self {
        Timestamp::Aware(t.fixed_offset())
    }
}

/// Apply the display policy to a backend timestamp.
///
/// With `use_tz` the result is aware and expressed in `tz`; without it the
/// result is the naive wall-clock time in `tz`.
pub fn convert_modified_time(raw: Timestamp, use_tz: bool, tz: &DisplayTimeZone) -> Timestamp {
    if !use_tz {
        return Timestamp::Naive(raw.to_naive(tz));
    }
    match raw {
        Timestamp::Naive(t) => Timestamp::Aware(tz.localize(&t)),
        Timestamp::Aware(t) => Timestamp::Aware(tz.convert(&t)),
    }
}
