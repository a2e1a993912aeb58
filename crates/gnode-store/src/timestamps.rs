//! Timestamp encoding.
//!
//! Every timestamp is written as a fixed-width RFC 3339 UTC string with
//! microsecond precision, so SQL string comparison orders them
//! chronologically.

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};

/// Current time truncated to the stored precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn encode(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode(s: &str) -> chrono::ParseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Start instant for a version that follows one starting at `previous`.
///
/// Normally "now"; bumped one microsecond past `previous` when the clock has
/// not advanced, so validity intervals are never empty.
pub fn successor_start(previous: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = now();
    let floor = previous + Duration::microseconds(1);
    if candidate < floor {
        floor
    } else {
        candidate
    }
}

/// Column-level helper mirroring the row mappers' error convention.
pub(crate) fn column(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    decode(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_sorts_chronologically() {
        let a = now();
        let b = a + Duration::microseconds(1);
        let c = a + Duration::seconds(90);
        assert!(encode(a) < encode(b));
        assert!(encode(b) < encode(c));
        assert_eq!(encode(a).len(), encode(c).len());
    }

    #[test]
    fn round_trip_keeps_microseconds() {
        let a = now();
        assert_eq!(decode(&encode(a)).unwrap(), a);
    }

    #[test]
    fn successor_is_strictly_later() {
        let future = now() + Duration::seconds(5);
        assert!(successor_start(future) > future);
    }
}
