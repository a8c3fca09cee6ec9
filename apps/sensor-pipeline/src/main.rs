use anyhow::{bail, Context, Result};
use sensor_pipeline::channel::{ChannelConfig, ChannelError, HttpChannelClient};
use sensor_pipeline::config::Config;
use sensor_pipeline::feed::{DashboardFeed, LogSink, PresentationSink, WatchSink};
use sensor_pipeline::fetcher::Fetcher;
use sensor_pipeline::http::{router, HttpState};
use sensor_pipeline::source::{spawn_upload_loop, SimulatedSensor};
use sensor_pipeline::telemetry;
use sensor_pipeline::uploader::Uploader;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Confirms the read key resolves to the configured channel. Only a transient
/// failure is tolerated here; the feed retries on its own schedule.
async fn verify_channel(client: &HttpChannelClient, channel: &ChannelConfig) -> Result<()> {
    match client.channel_info(channel).await {
        Ok(info) => {
            if let Some(id) = info.id {
                if id.to_string() != channel.channel_id.trim() {
                    bail!(
                        "read key belongs to channel {id}, not the configured channel {}",
                        channel.channel_id
                    );
                }
            }
            tracing::info!(
                channel = %channel.channel_id,
                name = info.name.as_deref().unwrap_or(""),
                last_entry_id = ?info.last_entry_id,
                "channel reachable"
            );
            Ok(())
        }
        Err(ChannelError::Network(detail)) => {
            tracing::warn!(channel = %channel.channel_id, error = %detail, "channel check failed; continuing");
            Ok(())
        }
        Err(ChannelError::NotFound) => bail!("channel {} does not exist", channel.channel_id),
        Err(err) => Err(err).context("channel check rejected the configured read key"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    telemetry::init(config.otlp_endpoint.as_deref(), &config.channel_id)?;

    let channel = config.channel_config();
    tracing::info!(config = ?channel, "{} starting", telemetry::SERVICE_NAME);

    let client = HttpChannelClient::new(&config.api_base, config.request_timeout())?;
    if config.enable_feed {
        verify_channel(&client, &channel).await?;
    }
    let client = Arc::new(client);
    let policy = config.retry_policy();
    let cancel = CancellationToken::new();

    let (watch_sink, snapshots) = WatchSink::new();
    let feed_handle = if config.enable_feed {
        let sink: Arc<dyn PresentationSink> = Arc::new(FanoutSink {
            watch: watch_sink,
            log: LogSink,
        });
        let feed = DashboardFeed::new(
            Fetcher::new(client.clone(), policy),
            channel.clone(),
            config.feed_settings()?,
            sink,
        )
        .context("invalid dashboard feed settings")?;
        Some(feed.start(cancel.clone()))
    } else {
        None
    };

    let uploader = Uploader::new(client.clone(), policy);
    let upload_stats = config.enable_uploader.then(|| uploader.stats());
    let upload_handle = if config.enable_uploader {
        Some(spawn_upload_loop(
            SimulatedSensor::from_entropy(),
            uploader,
            channel.clone(),
            config.upload_interval(),
            cancel.clone(),
        ))
    } else {
        None
    };

    let app = router(HttpState {
        snapshots,
        uploads: upload_stats,
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "dashboard HTTP listening");
    let shutdown = cancel.clone().cancelled_owned();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = http_handle => {
            if let Ok(Err(err)) = res { tracing::error!(error=%err, "HTTP server exited"); }
        }
    }

    cancel.cancel();
    for handle in [feed_handle, upload_handle].into_iter().flatten() {
        if let Err(err) = handle.await {
            tracing::warn!(error=%err, "background task ended abnormally");
        }
    }

    Ok(())
}

struct FanoutSink {
    watch: WatchSink,
    log: LogSink,
}

impl PresentationSink for FanoutSink {
    fn publish(&self, snapshot: sensor_pipeline::feed::FeedSnapshot) {
        self.log.publish(snapshot.clone());
        self.watch.publish(snapshot);
    }

    fn mark_stale(&self, error: &str) {
        self.log.mark_stale(error);
        self.watch.mark_stale(error);
    }
}
