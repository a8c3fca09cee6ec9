use crate::channel::{ChannelClient, ChannelConfig, ChannelError, RawRecord, ReadWindow};
use crate::reading::{FieldSlot, Reading, ReadingError};
use crate::retry::RetryPolicy;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Arc;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("record has no created_at timestamp")]
    MissingTimestamp,
    #[error("unparseable timestamp {0:?}")]
    BadTimestamp(String),
    #[error("{slot} value {raw:?} is not a finite number")]
    BadValue { slot: FieldSlot, raw: String },
    #[error(transparent)]
    Invalid(#[from] ReadingError),
}

/// Decoded history window. `skipped` counts records that failed to decode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    pub readings: Vec<Reading>,
    pub skipped: usize,
    pub attempts: u32,
}

impl FetchReport {
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.readings.iter().max_by_key(|reading| reading.timestamp())
    }
}

impl IntoIterator for FetchReport {
    type Item = Reading;
    type IntoIter = std::vec::IntoIter<Reading>;

    fn into_iter(self) -> Self::IntoIter {
        self.readings.into_iter()
    }
}

#[derive(Clone)]
pub struct Fetcher {
    client: Arc<dyn ChannelClient>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(client: Arc<dyn ChannelClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn fetch(
        &self,
        config: &ChannelConfig,
        window: &ReadWindow,
    ) -> Result<FetchReport, ChannelError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.client.read(config, window).await {
                Ok(records) => {
                    let mut report = decode_records(&records);
                    report.attempts = attempts;
                    if report.skipped > 0 {
                        tracing::warn!(
                            channel = %config.channel_id,
                            skipped = report.skipped,
                            decoded = report.readings.len(),
                            "skipped malformed records"
                        );
                    }
                    return Ok(report);
                }
                Err(ChannelError::NotFound) => {
                    tracing::debug!(channel = %config.channel_id, "no entries in window");
                    return Ok(FetchReport {
                        attempts,
                        ..FetchReport::default()
                    });
                }
                Err(ChannelError::Network(detail)) if self.policy.should_retry(attempts) => {
                    let delay = self.policy.delay_after(attempts);
                    tracing::warn!(
                        channel = %config.channel_id,
                        error = %detail,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "fetch failed; retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub fn decode_records(records: &[RawRecord]) -> FetchReport {
    let mut report = FetchReport::default();
    for record in records {
        match decode_record(record) {
            Ok(reading) => report.readings.push(reading),
            Err(err) => {
                report.skipped += 1;
                tracing::debug!(entry_id = ?record.entry_id, error = %err, "record skipped");
            }
        }
    }
    report
}

pub fn decode_record(record: &RawRecord) -> Result<Reading, DecodeError> {
    let raw_ts = record
        .created_at
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or(DecodeError::MissingTimestamp)?;
    let timestamp = parse_timestamp(raw_ts)?;

    let mut fields = Vec::with_capacity(FieldSlot::ALL.len());
    for (slot, raw) in FieldSlot::ALL.into_iter().zip(record.fields.iter()) {
        let Some(raw) = raw.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) else {
            continue;
        };
        let value = raw
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| DecodeError::BadValue {
                slot,
                raw: raw.to_string(),
            })?;
        fields.push((slot, value));
    }

    Ok(Reading::at(timestamp, fields)?)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = raw.strip_suffix(" UTC").unwrap_or(raw);
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .map_err(|_| DecodeError::BadTimestamp(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{reading_at, test_channel_config, StubChannel};
    use crate::uploader::Uploader;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn raw(created_at: Option<&str>, fields: [Option<&str>; 4]) -> RawRecord {
        RawRecord {
            entry_id: None,
            created_at: created_at.map(str::to_string),
            fields: fields.map(|f| f.map(str::to_string)),
        }
    }

    #[test]
    fn missing_slots_decode_as_absent_not_zero() {
        let reading = decode_record(&raw(
            Some("2026-02-01T10:00:00Z"),
            [Some("21.5"), None, Some(""), Some("  ")],
        ))
        .unwrap();
        assert_eq!(reading.get(FieldSlot::Temperature), Some(21.5));
        assert_eq!(reading.get(FieldSlot::Humidity), None);
        assert_eq!(reading.get(FieldSlot::Pressure), None);
        assert_eq!(reading.get(FieldSlot::AirQuality), None);
    }

    #[test]
    fn accepts_store_style_naive_timestamps() {
        let reading =
            decode_record(&raw(Some("2026-02-01 10:00:00 UTC"), [Some("1"), None, None, None]))
                .unwrap();
        assert_eq!(
            reading.timestamp(),
            Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn malformed_records_are_rejected_individually() {
        assert_eq!(
            decode_record(&raw(None, [Some("1"), None, None, None])),
            Err(DecodeError::MissingTimestamp)
        );
        assert!(matches!(
            decode_record(&raw(Some("yesterday"), [None, None, None, None])),
            Err(DecodeError::BadTimestamp(_))
        ));
        assert!(matches!(
            decode_record(&raw(
                Some("2026-02-01T10:00:00Z"),
                [Some("warm"), None, None, None]
            )),
            Err(DecodeError::BadValue {
                slot: FieldSlot::Temperature,
                ..
            })
        ));
        assert!(matches!(
            decode_record(&raw(
                Some("2026-02-01T10:00:00Z"),
                [None, None, Some("NaN"), None]
            )),
            Err(DecodeError::BadValue {
                slot: FieldSlot::Pressure,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn empty_window_is_an_empty_result() {
        let stub = Arc::new(StubChannel::new());
        let fetcher = Fetcher::new(stub.clone(), RetryPolicy::default());
        let report = fetcher
            .fetch(&test_channel_config(), &ReadWindow::latest(50))
            .await
            .expect("empty fetch is not an error");
        assert!(report.is_empty());
        assert_eq!(report.skipped, 0);
        assert_eq!(stub.read_calls(), 1);
    }

    #[tokio::test]
    async fn skips_and_counts_malformed_records() {
        let stub = Arc::new(StubChannel::new());
        stub.push_raw(raw(Some("2026-02-01T10:00:00Z"), [Some("20"), None, None, None]));
        stub.push_raw(raw(Some("2026-02-01T10:01:00Z"), [Some("oops"), None, None, None]));
        stub.push_raw(raw(None, [Some("21"), None, None, None]));
        stub.push_raw(raw(Some("2026-02-01T10:02:00Z"), [None, Some("45"), None, None]));
        let fetcher = Fetcher::new(stub, RetryPolicy::default());

        let report = fetcher
            .fetch(&test_channel_config(), &ReadWindow::latest(50))
            .await
            .unwrap();
        assert_eq!(report.readings.len(), 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(
            report.latest().and_then(|r| r.get(FieldSlot::Humidity)),
            Some(45.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_are_retried_with_backoff() {
        let stub = Arc::new(StubChannel::new());
        stub.push_reading(&reading_at(
            Utc::now(),
            &[(FieldSlot::Temperature, 20.0)],
        ));
        stub.fail_reads_with([
            ChannelError::Network("reset".into()),
            ChannelError::Network("reset".into()),
        ]);
        let fetcher = Fetcher::new(stub.clone(), RetryPolicy::default());

        let report = fetcher
            .fetch(&test_channel_config(), &ReadWindow::latest(10))
            .await
            .unwrap();
        assert_eq!(report.readings.len(), 1);
        assert_eq!(report.attempts, 3);
        assert_eq!(stub.read_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn network_retries_are_bounded() {
        let stub = Arc::new(StubChannel::new());
        stub.always_fail_reads(ChannelError::Network("unreachable".into()));
        let fetcher = Fetcher::new(stub.clone(), RetryPolicy::default());

        let err = fetcher
            .fetch(&test_channel_config(), &ReadWindow::latest(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Network(_)));
        assert_eq!(stub.read_calls(), 3);
    }

    #[tokio::test]
    async fn auth_errors_fail_immediately() {
        let stub = Arc::new(StubChannel::new());
        stub.always_fail_reads(ChannelError::Auth("bad read key".into()));
        let fetcher = Fetcher::new(stub.clone(), RetryPolicy::default());

        let err = fetcher
            .fetch(&test_channel_config(), &ReadWindow::latest(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Auth(_)));
        assert_eq!(stub.read_calls(), 1);
    }

    #[tokio::test]
    async fn uploaded_reading_round_trips_through_the_store() {
        let stub = Arc::new(StubChannel::new());
        let config = test_channel_config();
        let uploader = Uploader::new(stub.clone(), RetryPolicy::default());
        let fetcher = Fetcher::new(stub.clone(), RetryPolicy::default());

        let original = Reading::new([(FieldSlot::Temperature, 21.5), (FieldSlot::Humidity, 40.0)])
            .unwrap();
        assert!(uploader.upload(&config, &original).await.is_success());

        let now = Utc::now();
        let window = ReadWindow::trailing(
            now + ChronoDuration::seconds(5),
            ChronoDuration::minutes(5),
            10,
        )
        .unwrap();
        let report = fetcher.fetch(&config, &window).await.unwrap();
        assert_eq!(report.readings.len(), 1);
        let decoded = &report.readings[0];
        let temperature = decoded.get(FieldSlot::Temperature).unwrap();
        let humidity = decoded.get(FieldSlot::Humidity).unwrap();
        assert!((temperature - 21.5).abs() < 1e-9);
        assert!((humidity - 40.0).abs() < 1e-9);
        assert_eq!(decoded.get(FieldSlot::Pressure), None);
        assert_eq!(decoded.get(FieldSlot::AirQuality), None);
        assert!((decoded.timestamp() - original.timestamp()).num_seconds().abs() <= 1);
    }
}
