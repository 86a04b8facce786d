//! Per-server heartbeat timestamps

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Truncate `timestamp` down to a multiple of `granularity`
///
/// Two instants inside the same granularity window compare equal after
/// truncation. A zero granularity leaves the timestamp untouched.
#[must_use]
pub fn trim_timestamp(timestamp: DateTime<Utc>, granularity: Duration) -> DateTime<Utc> {
    let step = i64::try_from(granularity.as_millis()).unwrap_or(i64::MAX);
    if step == 0 {
        return timestamp;
    }

    let millis = timestamp.timestamp_millis();
    DateTime::<Utc>::from_timestamp_millis(millis - millis.rem_euclid(step)).unwrap_or(timestamp)
}

/// Last heartbeat written by a cluster member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHeartbeat {
    pub server_name: String,
    pub timestamp: DateTime<Utc>,
}

impl ServerHeartbeat {
    #[must_use]
    pub fn new(server_name: impl Into<String>, timestamp: DateTime<Utc>, granularity: Duration) -> Self {
        Self {
            server_name: server_name.into(),
            timestamp: trim_timestamp(timestamp, granularity),
        }
    }

    /// Parse a stored value; `None` for absent or malformed entries
    #[must_use]
    pub fn parse(server_name: impl Into<String>, raw: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(raw.trim()).ok().map(|ts| Self {
            server_name: server_name.into(),
            timestamp: ts.with_timezone(&Utc),
        })
    }

    /// Representation written to the configuration store
    #[must_use]
    pub fn to_stored(&self) -> String {
        self.timestamp.to_rfc3339()
    }

    /// Whether the heartbeat is at or before `threshold`
    #[must_use]
    pub fn is_outdated(&self, threshold: DateTime<Utc>) -> bool {
        self.timestamp <= threshold
    }
}

/// Outcome of writing the local heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatResult {
    pub updated: bool,
    /// No heartbeat had been stored for this server before
    pub is_new_server: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_trim_to_second() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap()
            + chrono::Duration::milliseconds(987);
        let trimmed = trim_timestamp(ts, Duration::from_secs(1));
        assert_eq!(trimmed, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap());
    }

    #[test]
    fn test_same_window_compares_equal() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let a = ServerHeartbeat::new("a", base + chrono::Duration::milliseconds(100), Duration::from_secs(1));
        let b = ServerHeartbeat::new("a", base + chrono::Duration::milliseconds(900), Duration::from_secs(1));
        assert_eq!(a, b);
    }

    #[test]
    fn test_coarse_granularity() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 59).unwrap();
        let trimmed = trim_timestamp(ts, Duration::from_secs(60));
        assert_eq!(trimmed, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn test_zero_granularity_is_identity() {
        let ts = Utc::now();
        assert_eq!(trim_timestamp(ts, Duration::ZERO), ts);
    }

    #[test]
    fn test_stored_roundtrip_and_garbage() {
        let hb = ServerHeartbeat::new("node1", Utc::now(), Duration::from_secs(1));
        assert_eq!(ServerHeartbeat::parse("node1", &hb.to_stored()), Some(hb));
        assert_eq!(ServerHeartbeat::parse("node1", "yesterday"), None);
    }

    #[test]
    fn test_outdated_is_inclusive() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let hb = ServerHeartbeat::new("node1", now, Duration::from_secs(1));
        assert!(hb.is_outdated(now));
        assert!(!hb.is_outdated(now - chrono::Duration::seconds(1)));
    }
}
