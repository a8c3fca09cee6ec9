mod http;

pub use http::{ChannelInfo, HttpChannelClient, DEFAULT_API_BASE};

use crate::reading::{FieldMap, Reading, FIELD_SLOT_COUNT};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::time::Duration;

/// Largest result count the store hands back for one read.
pub const MAX_READ_RESULTS: u32 = 8000;

/// Remote store target. Replaced wholesale on reconfiguration, never mutated.
#[derive(Clone)]
pub struct ChannelConfig {
    pub channel_id: String,
    pub write_key: String,
    pub read_key: String,
    pub min_write_interval: Duration,
    pub field_map: FieldMap,
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("channel_id", &self.channel_id)
            .field("write_key", &redact(&self.write_key))
            .field("read_key", &redact(&self.read_key))
            .field("min_write_interval", &self.min_write_interval)
            .field("field_map", &self.field_map.to_string())
            .finish()
    }
}

fn redact(key: &str) -> &'static str {
    if key.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("store rejected the write: minimum write interval not respected")]
    RateLimited,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid field value: {0}")]
    InvalidField(String),
    #[error("channel has no entries in the requested range")]
    NotFound,
}

impl ChannelError {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelError::RateLimited => "rate_limited",
            ChannelError::Auth(_) => "auth",
            ChannelError::Network(_) => "network",
            ChannelError::InvalidField(_) => "invalid_field",
            ChannelError::NotFound => "not_found",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Network(_))
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            ChannelError::Network(format!("request timed out: {err}"))
        } else {
            ChannelError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub entry_id: u64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Bounds for one read: up to `limit` most-recent entries inside `start..end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl ReadWindow {
    pub fn latest(limit: u32) -> Self {
        Self {
            start: None,
            end: None,
            limit: limit.clamp(1, MAX_READ_RESULTS),
        }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>, limit: u32) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            limit: limit.clamp(1, MAX_READ_RESULTS),
        }
    }

    /// `None` when `span` reaches past the earliest representable instant.
    pub fn trailing(now: DateTime<Utc>, span: ChronoDuration, limit: u32) -> Option<Self> {
        let start = now.checked_sub_signed(span)?;
        Some(Self::between(start, now, limit))
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| ts >= start) && self.end.map_or(true, |end| ts <= end)
    }
}

/// One undecoded store record; field values are kept as the text the store
/// returned so decoding can reject them one record at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub entry_id: Option<u64>,
    pub created_at: Option<String>,
    pub fields: [Option<String>; FIELD_SLOT_COUNT],
}

/// Transport binding to the remote store. One outbound call per invocation and
/// no retries; retry policy belongs to the callers.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    async fn write(
        &self,
        config: &ChannelConfig,
        reading: &Reading,
    ) -> Result<WriteReceipt, ChannelError>;

    async fn read(
        &self,
        config: &ChannelConfig,
        window: &ReadWindow,
    ) -> Result<Vec<RawRecord>, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_limit_is_clamped() {
        assert_eq!(ReadWindow::latest(0).limit, 1);
        assert_eq!(ReadWindow::latest(20_000).limit, MAX_READ_RESULTS);
    }

    #[test]
    fn trailing_window_contains_its_bounds() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let window = ReadWindow::trailing(now, ChronoDuration::minutes(10), 50).unwrap();
        assert!(window.contains(now));
        assert!(window.contains(now - ChronoDuration::minutes(10)));
        assert!(!window.contains(now - ChronoDuration::minutes(11)));
    }

    #[test]
    fn trailing_window_past_the_calendar_is_refused() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(ReadWindow::trailing(now, ChronoDuration::MAX, 50).is_none());
    }

    #[test]
    fn only_network_errors_are_transient() {
        assert!(ChannelError::Network("reset".into()).is_transient());
        assert!(!ChannelError::RateLimited.is_transient());
        assert!(!ChannelError::Auth("bad key".into()).is_transient());
        assert!(!ChannelError::InvalidField("field1".into()).is_transient());
        assert!(!ChannelError::NotFound.is_transient());
    }

    #[test]
    fn debug_output_hides_keys() {
        let config = ChannelConfig {
            channel_id: "42".into(),
            write_key: "WRITEKEY".into(),
            read_key: String::new(),
            min_write_interval: Duration::from_secs(15),
            field_map: FieldMap::default(),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("WRITEKEY"));
        assert!(rendered.contains("<unset>"));
    }
}
