//! Date-time parsing and formatting for the outer surfaces.
//!
//! The engine only ever sees Unix milliseconds. Text arrives from SQL literals
//! and JSON bodies, and a bare calendar date is never accepted where an
//! appointment needs a concrete instant.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::Ms;

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    /// A calendar date where a date-time was required.
    DateOnly(String),
    Invalid(String),
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampError::DateOnly(s) => {
                write!(f, "'{s}' is a date; a date and time is required")
            }
            TimestampError::Invalid(s) => write!(f, "'{s}' is not a valid date-time"),
        }
    }
}

impl std::error::Error for TimestampError {}

/// Parse a full date-time. Accepts RFC 3339, `YYYY-MM-DD HH:MM[:SS[.f]]`
/// (read as UTC) and raw Unix milliseconds.
pub fn parse_datetime(text: &str) -> Result<Ms, TimestampError> {
    let s = text.trim();
    if !s.is_empty() && s.trim_start_matches('-').bytes().all(|b| b.is_ascii_digit()) {
        return s.parse().map_err(|_| TimestampError::Invalid(s.to_string()));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    if NaiveDate::parse_from_str(s, DATE_FORMAT).is_ok() {
        return Err(TimestampError::DateOnly(s.to_string()));
    }
    Err(TimestampError::Invalid(s.to_string()))
}

/// Like [`parse_datetime`], but a bare date means midnight UTC. Used for
/// range filters, never for appointment starts.
pub fn parse_datetime_lenient(text: &str) -> Result<Ms, TimestampError> {
    match parse_datetime(text) {
        Err(TimestampError::DateOnly(s)) => {
            let date = parse_date(&s)?;
            Ok(date.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp_millis()))
        }
        other => other,
    }
}

pub fn parse_date(text: &str) -> Result<NaiveDate, TimestampError> {
    let s = text.trim();
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| TimestampError::Invalid(s.to_string()))
}

/// RFC 3339 in UTC, e.g. `2026-10-16T10:00:00Z`.
pub fn format_ms(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        None => ms.to_string(),
    }
}

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// A date-time crossing a JSON boundary: serialized as RFC 3339, deserialized
/// from either a date-time string or Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(pub Ms);

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_ms(self.0))
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TimestampVisitor;

        impl Visitor<'_> for TimestampVisitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a date-time string or Unix milliseconds")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
                Ok(Timestamp(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
                Ms::try_from(v)
                    .map(Timestamp)
                    .map_err(|_| E::custom("timestamp out of range"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
                parse_datetime(v).map(Timestamp).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(TimestampVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_space_separated_as_utc() {
        let ms = parse_datetime("2026-10-16 10:00").unwrap();
        assert_eq!(format_ms(ms), "2026-10-16T10:00:00Z");
        assert_eq!(parse_datetime("2026-10-16 10:00:00").unwrap(), ms);
        assert_eq!(parse_datetime("2026-10-16T10:00").unwrap(), ms);
    }

    #[test]
    fn parses_rfc3339_with_offset() {
        let ms = parse_datetime("2026-10-16T07:00:00-03:00").unwrap();
        assert_eq!(format_ms(ms), "2026-10-16T10:00:00Z");
    }

    #[test]
    fn parses_unix_millis() {
        assert_eq!(parse_datetime("1792144800000").unwrap(), 1_792_144_800_000);
    }

    #[test]
    fn bare_date_is_rejected() {
        assert_eq!(
            parse_datetime("2026-10-16"),
            Err(TimestampError::DateOnly("2026-10-16".into()))
        );
    }

    #[test]
    fn lenient_reads_bare_date_as_midnight() {
        let ms = parse_datetime_lenient("2026-10-16").unwrap();
        assert_eq!(format_ms(ms), "2026-10-16T00:00:00Z");
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(parse_datetime("tomorrow"), Err(TimestampError::Invalid(_))));
        assert!(matches!(parse_datetime(""), Err(TimestampError::Invalid(_))));
    }

    #[test]
    fn timestamp_json_accepts_string_and_number() {
        let a: Timestamp = serde_json::from_str("\"2026-10-16T10:00:00Z\"").unwrap();
        let b: Timestamp = serde_json::from_str(&a.0.to_string()).unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"2026-10-16T10:00:00Z\"");
    }

    #[test]
    fn timestamp_json_rejects_bare_date() {
        let err = serde_json::from_str::<Timestamp>("\"2026-10-16\"").unwrap_err();
        assert!(err.to_string().contains("date and time is required"));
    }
}
