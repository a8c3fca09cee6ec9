use crate::channel::{
    ChannelClient, ChannelConfig, ChannelError, RawRecord, ReadWindow, WriteReceipt,
};
use crate::reading::{FieldMap, FieldSlot, Reading};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub fn test_channel_config() -> ChannelConfig {
    ChannelConfig {
        channel_id: "1234567".to_string(),
        write_key: "WRITEKEY".to_string(),
        read_key: "READKEY".to_string(),
        min_write_interval: Duration::from_secs(15),
        field_map: FieldMap::default(),
    }
}

/// In-memory stand-in for the remote store. Scripted errors are consumed in
/// order before the stub falls back to `always_*` or to normal behaviour.
#[derive(Default)]
pub struct StubChannel {
    write_script: Mutex<VecDeque<ChannelError>>,
    read_script: Mutex<VecDeque<ChannelError>>,
    read_delays: Mutex<VecDeque<Duration>>,
    always_write: Mutex<Option<ChannelError>>,
    always_read: Mutex<Option<ChannelError>>,
    records: Mutex<Vec<RawRecord>>,
    write_calls: Mutex<Vec<Instant>>,
    read_calls: Mutex<Vec<Instant>>,
}

impl StubChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_with(&self, errors: impl IntoIterator<Item = ChannelError>) {
        lock(&self.write_script).extend(errors);
    }

    pub fn fail_reads_with(&self, errors: impl IntoIterator<Item = ChannelError>) {
        lock(&self.read_script).extend(errors);
    }

    /// Each read sleeps for the next queued delay before answering.
    pub fn delay_reads(&self, delays: impl IntoIterator<Item = Duration>) {
        lock(&self.read_delays).extend(delays);
    }

    pub fn always_fail_writes(&self, error: ChannelError) {
        *lock(&self.always_write) = Some(error);
    }

    pub fn always_fail_reads(&self, error: ChannelError) {
        *lock(&self.always_read) = Some(error);
    }

    pub fn push_raw(&self, record: RawRecord) {
        lock(&self.records).push(record);
    }

    pub fn push_reading(&self, reading: &Reading) {
        let entry_id = lock(&self.records).len() as u64 + 1;
        self.push_raw(encode(entry_id, reading));
    }

    pub fn write_calls(&self) -> Vec<Instant> {
        lock(&self.write_calls).clone()
    }

    pub fn read_calls(&self) -> usize {
        lock(&self.read_calls).len()
    }

    pub fn read_times(&self) -> Vec<Instant> {
        lock(&self.read_calls).clone()
    }

    pub fn stored(&self) -> usize {
        lock(&self.records).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn encode(entry_id: u64, reading: &Reading) -> RawRecord {
    let mut fields: [Option<String>; 4] = Default::default();
    for (slot, value) in reading.populated() {
        fields[slot.ordinal() as usize - 1] = Some(value.to_string());
    }
    RawRecord {
        entry_id: Some(entry_id),
        created_at: Some(
            reading
                .timestamp()
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        fields,
    }
}

fn record_time(record: &RawRecord) -> Option<DateTime<Utc>> {
    record
        .created_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl ChannelClient for StubChannel {
    async fn write(
        &self,
        _config: &ChannelConfig,
        reading: &Reading,
    ) -> Result<WriteReceipt, ChannelError> {
        lock(&self.write_calls).push(Instant::now());
        if let Some(err) = lock(&self.write_script).pop_front() {
            return Err(err);
        }
        if let Some(err) = lock(&self.always_write).clone() {
            return Err(err);
        }
        let mut records = lock(&self.records);
        let entry_id = records.len() as u64 + 1;
        records.push(encode(entry_id, reading));
        Ok(WriteReceipt {
            entry_id,
            created_at: Some(reading.timestamp()),
        })
    }

    async fn read(
        &self,
        _config: &ChannelConfig,
        window: &ReadWindow,
    ) -> Result<Vec<RawRecord>, ChannelError> {
        lock(&self.read_calls).push(Instant::now());
        let delay = lock(&self.read_delays).pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = lock(&self.read_script).pop_front() {
            return Err(err);
        }
        if let Some(err) = lock(&self.always_read).clone() {
            return Err(err);
        }
        let records = lock(&self.records);
        let matching: Vec<RawRecord> = records
            .iter()
            .filter(|record| record_time(record).map_or(true, |ts| window.contains(ts)))
            .cloned()
            .collect();
        if matching.is_empty() {
            return Err(ChannelError::NotFound);
        }
        let skip = matching.len().saturating_sub(window.limit as usize);
        Ok(matching.into_iter().skip(skip).collect())
    }
}

pub fn reading_at(ts: DateTime<Utc>, fields: &[(FieldSlot, f64)]) -> Reading {
    Reading::at(ts, fields.iter().copied()).expect("valid test reading")
}
