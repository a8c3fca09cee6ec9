use crate::channel::{ChannelClient, ChannelConfig, ChannelError};
use crate::reading::Reading;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, sleep_until, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Succeeded {
        entry_id: u64,
        timestamp: DateTime<Utc>,
    },
    Failed {
        error: ChannelError,
        attempts: u32,
    },
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Succeeded { .. })
    }
}

type Lane = Arc<AsyncMutex<Option<Instant>>>;

/// Last successful write per channel id. Each channel gets its own async lock,
/// held across check, write and update, so writes to one channel never overlap.
#[derive(Debug, Default)]
pub struct WriteGate {
    lanes: Mutex<HashMap<String, Lane>>,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, channel_id: &str) -> Lane {
        let mut lanes = self
            .lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        lanes
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Non-blocking peek; `None` while a write for the channel is in flight.
    pub fn last_write(&self, channel_id: &str) -> Option<Instant> {
        let lane = self.lane(channel_id);
        let guard = lane.try_lock().ok()?;
        *guard
    }
}

#[derive(Debug, Default)]
pub struct UploadStats {
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub network_retries: AtomicU64,
    pub rate_limit_violations: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl UploadStats {
    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }
}

#[derive(Clone)]
pub struct Uploader {
    client: Arc<dyn ChannelClient>,
    gate: Arc<WriteGate>,
    policy: RetryPolicy,
    stats: Arc<UploadStats>,
}

impl Uploader {
    pub fn new(client: Arc<dyn ChannelClient>, policy: RetryPolicy) -> Self {
        Self::with_gate(client, policy, Arc::new(WriteGate::new()))
    }

    pub fn with_gate(client: Arc<dyn ChannelClient>, policy: RetryPolicy, gate: Arc<WriteGate>) -> Self {
        Self {
            client,
            gate,
            policy,
            stats: Arc::new(UploadStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<UploadStats> {
        self.stats.clone()
    }

    pub fn gate(&self) -> Arc<WriteGate> {
        self.gate.clone()
    }

    pub async fn upload(&self, config: &ChannelConfig, reading: &Reading) -> UploadOutcome {
        if let Err(error) = check_writable(config, reading) {
            return self.discard(config, reading, error, 0);
        }

        let lane = self.gate.lane(&config.channel_id);
        let mut last_write = lane.lock().await;

        let mut attempts = 0u32;
        let mut network_failures = 0u32;
        let mut rate_limit_retried = false;

        loop {
            if let Some(last) = *last_write {
                let ready_at = last + config.min_write_interval;
                let now = Instant::now();
                if now < ready_at {
                    tracing::debug!(
                        channel = %config.channel_id,
                        wait_ms = (ready_at - now).as_millis() as u64,
                        "waiting for minimum write interval"
                    );
                    sleep_until(ready_at).await;
                }
            }

            attempts += 1;
            match self.client.write(config, reading).await {
                Ok(receipt) => {
                    *last_write = Some(Instant::now());
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    self.stats.clear_error();
                    tracing::info!(
                        channel = %config.channel_id,
                        entry_id = receipt.entry_id,
                        attempts,
                        "reading uploaded"
                    );
                    return UploadOutcome::Succeeded {
                        entry_id: receipt.entry_id,
                        timestamp: receipt.created_at.unwrap_or_else(|| reading.timestamp()),
                    };
                }
                Err(ChannelError::Network(detail)) => {
                    network_failures += 1;
                    if !self.policy.should_retry(network_failures) {
                        return self.discard(
                            config,
                            reading,
                            ChannelError::Network(detail),
                            attempts,
                        );
                    }
                    let delay = self.policy.delay_after(network_failures);
                    self.stats.network_retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        channel = %config.channel_id,
                        error = %detail,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "upload failed; retrying"
                    );
                    sleep(delay).await;
                }
                Err(ChannelError::RateLimited) => {
                    self.stats
                        .rate_limit_violations
                        .fetch_add(1, Ordering::Relaxed);
                    if rate_limit_retried {
                        return self.discard(config, reading, ChannelError::RateLimited, attempts);
                    }
                    rate_limit_retried = true;
                    tracing::warn!(
                        channel = %config.channel_id,
                        interval_secs = config.min_write_interval.as_secs_f64(),
                        "store rate-limited a write the interval guard allowed; waiting one interval"
                    );
                    sleep(config.min_write_interval).await;
                }
                Err(error) => return self.discard(config, reading, error, attempts),
            }
        }
    }

    fn discard(
        &self,
        config: &ChannelConfig,
        reading: &Reading,
        error: ChannelError,
        attempts: u32,
    ) -> UploadOutcome {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.stats.record_error(error.to_string());
        tracing::error!(
            channel = %config.channel_id,
            error = %error,
            kind = error.kind(),
            attempts,
            reading = %reading,
            "upload failed; reading discarded"
        );
        UploadOutcome::Failed { error, attempts }
    }
}

fn check_writable(config: &ChannelConfig, reading: &Reading) -> Result<(), ChannelError> {
    if reading.is_empty() {
        return Err(ChannelError::InvalidField(
            "reading has no populated field slots".to_string(),
        ));
    }
    if let Some((slot, _)) = reading
        .populated()
        .find(|(slot, _)| !config.field_map.contains(*slot))
    {
        return Err(ChannelError::InvalidField(format!(
            "{slot} ({}) is not mapped on channel {}",
            slot.field_key(),
            config.channel_id
        )));
    }
    Ok(())
}
