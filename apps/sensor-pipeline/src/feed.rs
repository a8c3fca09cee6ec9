use crate::aggregator::{aggregate, AggregateError, SeriesMap, MAX_BUCKETS};
use crate::channel::{ChannelConfig, ChannelError, ReadWindow};
use crate::fetcher::Fetcher;
use crate::reading::Reading;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Longest trailing window a feed may request (one leap year).
pub const MAX_FEED_WINDOW_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSettings {
    pub poll_interval: Duration,
    /// Trailing span fetched on every tick.
    pub window: ChronoDuration,
    pub results: u32,
    pub bucket_width: ChronoDuration,
    /// Per-request timeout of the underlying client; bounds one fetch attempt.
    pub request_timeout: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            window: ChronoDuration::minutes(60),
            results: 50,
            bucket_width: ChronoDuration::seconds(60),
            request_timeout: Duration::from_millis(3000),
        }
    }
}

impl FeedSettings {
    /// Rejects settings that could never produce a tick: an empty or
    /// oversized window, a bucket width that does not fit it, or a worst-case
    /// fetch under `policy` that overruns the poll interval.
    pub fn validate(&self, policy: &RetryPolicy) -> Result<(), FeedError> {
        if self.poll_interval.is_zero() {
            return Err(FeedError::ZeroPollInterval);
        }
        if self.window <= ChronoDuration::zero()
            || self.window.num_minutes() > MAX_FEED_WINDOW_MINUTES
        {
            return Err(FeedError::InvalidWindow(self.window));
        }
        let bucket_ms = self.bucket_width.num_milliseconds();
        if bucket_ms <= 0 || self.bucket_width > self.window {
            return Err(FeedError::InvalidBucketWidth {
                bucket_width: self.bucket_width,
                window: self.window,
            });
        }
        let buckets = self.window.num_milliseconds() / bucket_ms + 1;
        if buckets > MAX_BUCKETS {
            return Err(FeedError::TooManyBuckets { buckets });
        }
        let worst_case = policy.worst_case(self.request_timeout);
        if worst_case >= self.poll_interval {
            return Err(FeedError::TickBudget {
                worst_case,
                poll_interval: self.poll_interval,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("poll interval must be positive")]
    ZeroPollInterval,
    #[error("feed window {0} must be positive and at most {MAX_FEED_WINDOW_MINUTES} minutes")]
    InvalidWindow(ChronoDuration),
    #[error("bucket width {bucket_width} must be positive and no wider than the {window} window")]
    InvalidBucketWidth {
        bucket_width: ChronoDuration,
        window: ChronoDuration,
    },
    #[error("{buckets} buckets per window exceeds the limit of {MAX_BUCKETS}")]
    TooManyBuckets { buckets: i64 },
    #[error("trailing window of {0} reaches before the earliest representable time")]
    WindowOutOfRange(ChronoDuration),
    #[error(
        "worst-case tick of {worst_case:?} does not fit inside the {poll_interval:?} poll interval"
    )]
    TickBudget {
        worst_case: Duration,
        poll_interval: Duration,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedSnapshot {
    pub generated_at: DateTime<Utc>,
    pub series: SeriesMap,
    pub latest: Option<Reading>,
    pub readings: usize,
    pub skipped: usize,
    pub stale: bool,
    pub last_error: Option<String>,
}

/// Receives the outcome of every feed tick.
pub trait PresentationSink: Send + Sync {
    fn publish(&self, snapshot: FeedSnapshot);

    /// The tick failed; whatever was last published stays visible but is
    /// flagged as stale.
    fn mark_stale(&self, error: &str);
}

pub struct WatchSink {
    tx: watch::Sender<Option<FeedSnapshot>>,
}

impl WatchSink {
    pub fn new() -> (Self, watch::Receiver<Option<FeedSnapshot>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<FeedSnapshot>> {
        self.tx.subscribe()
    }
}

impl PresentationSink for WatchSink {
    fn publish(&self, snapshot: FeedSnapshot) {
        self.tx.send_replace(Some(snapshot));
    }

    fn mark_stale(&self, error: &str) {
        self.tx.send_if_modified(|current| match current {
            Some(snapshot) => {
                snapshot.stale = true;
                snapshot.last_error = Some(error.to_string());
                true
            }
            None => false,
        });
    }
}

pub struct LogSink;

impl PresentationSink for LogSink {
    fn publish(&self, snapshot: FeedSnapshot) {
        let gaps: usize = snapshot.series.values().map(|series| series.gaps()).sum();
        tracing::info!(
            readings = snapshot.readings,
            skipped = snapshot.skipped,
            series = snapshot.series.len(),
            gaps,
            latest = %snapshot.latest.as_ref().map(|r| r.to_string()).unwrap_or_default(),
            "dashboard refreshed"
        );
    }

    fn mark_stale(&self, error: &str) {
        tracing::warn!(error, "dashboard data is stale");
    }
}

pub struct DashboardFeed {
    fetcher: Fetcher,
    config: ChannelConfig,
    settings: FeedSettings,
    sink: Arc<dyn PresentationSink>,
}

impl DashboardFeed {
    pub fn new(
        fetcher: Fetcher,
        config: ChannelConfig,
        settings: FeedSettings,
        sink: Arc<dyn PresentationSink>,
    ) -> Result<Self, FeedError> {
        settings.validate(&fetcher.policy())?;
        Ok(Self {
            fetcher,
            config,
            settings,
            sink,
        })
    }

    pub fn settings(&self) -> FeedSettings {
        self.settings
    }

    /// Fetches the trailing window and aggregates it without publishing.
    pub async fn tick(&self) -> Result<FeedSnapshot, FeedError> {
        let now = Utc::now();
        let window = ReadWindow::trailing(now, self.settings.window, self.settings.results)
            .ok_or(FeedError::WindowOutOfRange(self.settings.window))?;
        let report = self.fetcher.fetch(&self.config, &window).await?;
        let series = aggregate(
            &report.readings,
            self.settings.bucket_width,
            self.config.field_map.slots(),
        )?;
        Ok(FeedSnapshot {
            generated_at: now,
            latest: report.latest().cloned(),
            readings: report.readings.len(),
            skipped: report.skipped,
            series,
            stale: false,
            last_error: None,
        })
    }

    /// Runs one tick and hands the result to the sink. Returns whether the
    /// tick succeeded.
    pub async fn run_once(&self) -> bool {
        match self.tick().await {
            Ok(snapshot) => {
                tracing::debug!(
                    channel = %self.config.channel_id,
                    readings = snapshot.readings,
                    skipped = snapshot.skipped,
                    "feed tick complete"
                );
                self.sink.publish(snapshot);
                true
            }
            Err(err) => {
                tracing::warn!(channel = %self.config.channel_id, "feed tick failed: {err:#}");
                self.sink.mark_stale(&err.to_string());
                false
            }
        }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            channel = %self.config.channel_id,
            poll_interval_secs = self.settings.poll_interval.as_secs_f64(),
            "dashboard feed started"
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
        tracing::info!(channel = %self.config.channel_id, "dashboard feed stopped");
    }
}
