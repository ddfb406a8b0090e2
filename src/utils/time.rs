//! Time formatting helpers shared by the codec, backup store and transfers

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

use crate::{Error, Result};

/// TR-069 sentinel for a time that is not yet known.
pub const UNKNOWN_TIME: &str = "0001-01-01T00:00:00Z";

/// Current time rendered the way it appears on the wire (CurrentTime,
/// StartTime, CompleteTime).
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn epoch_now() -> i64 {
    Utc::now().timestamp()
}

/// Parse `acs.periodic_time`. The value is UTC whether or not a trailing
/// 'Z' is present.
pub fn parse_config_time(value: &str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim().trim_end_matches('Z');
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| Error::parse(format!("bad timestamp '{}': {}", value, e)))?;
    Ok(naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_zulu_suffix() {
        let a = parse_config_time("2026-01-02T03:04:05Z").unwrap();
        let b = parse_config_time("2026-01-02T03:04:05").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.timestamp(), 1767323045);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_config_time("not-a-time").is_err());
    }

    #[test]
    fn wire_time_carries_zulu_suffix() {
        let now = now_iso8601();
        assert!(now.ends_with('Z'));
        assert!(now.contains('T'));
    }
}
