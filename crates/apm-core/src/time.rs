//! Clock abstraction and the store's timestamp text formats

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use parking_lot::RwLock;

/// Text layout of `DateTime` values as the store renders them
pub const STORE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the current UTC time. No guarantees are made about monotonicity
    fn now(&self) -> DateTime<Utc>;
}

/// A [`TimeProvider`] that uses [`Utc::now`] as a clock source
#[derive(Debug, Default)]
pub struct SystemProvider {}

impl SystemProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A [`TimeProvider`] that returns a fixed time that can be set by [`MockProvider::set`]
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<DateTime<Utc>>,
}

impl MockProvider {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.write() = time
    }

    pub fn inc(&self, duration: Duration) -> DateTime<Utc> {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

pub fn format_store_datetime(time: DateTime<Utc>) -> String {
    time.format(STORE_DATETIME_FORMAT).to_string()
}

/// Parse a store timestamp; fractional seconds and RFC 3339 are accepted too
pub fn parse_store_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, STORE_DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|t| t.with_timezone(&Utc)))
}

/// Epoch nanoseconds of a store timestamp, as exposed in responses
pub fn to_epoch_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt()
        .unwrap_or_else(|| time.timestamp().saturating_mul(1_000_000_000))
}

pub fn from_epoch_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_provider() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let provider = MockProvider::new(start);
        assert_eq!(provider.now(), start);
        let later = provider.inc(Duration::minutes(5));
        assert_eq!(later, Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap());
        assert_eq!(provider.now(), later);
    }

    #[test]
    fn test_store_datetime_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_store_datetime("2024-03-01 12:00:00"), Some(expected));
        assert_eq!(parse_store_datetime("2024-03-01 12:00:00.000000000"), Some(expected));
        assert_eq!(parse_store_datetime("2024-03-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_store_datetime("yesterday"), None);
        assert_eq!(format_store_datetime(expected), "2024-03-01 12:00:00");
    }

    #[test]
    fn test_epoch_nanos() {
        let time = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 1).unwrap();
        assert_eq!(to_epoch_nanos(time), 1_000_000_000);
        assert_eq!(from_epoch_nanos(1_000_000_000), time);
    }
}
