use crate::channel::{ChannelConfig, DEFAULT_API_BASE, MAX_READ_RESULTS};
use crate::feed::{FeedSettings, MAX_FEED_WINDOW_MINUTES};
use crate::reading::FieldMap;
use crate::retry::RetryPolicy;
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn setup_config_path(lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    non_empty(lookup, "PIPELINE_SETUP_CONFIG_PATH").map(PathBuf::from)
}

/// Optional JSON file written by the setup tooling. Every key is a fallback for
/// the matching environment variable and never overrides one that is set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfigOverrides {
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    write_api_key: Option<String>,
    #[serde(default)]
    read_api_key: Option<String>,
    #[serde(default)]
    api_base: Option<String>,
    #[serde(default)]
    min_write_interval_seconds: Option<u64>,
    #[serde(default)]
    field_map: Option<String>,
    #[serde(default)]
    enable_uploader: Option<bool>,
    #[serde(default)]
    upload_interval_seconds: Option<u64>,
    #[serde(default)]
    enable_feed: Option<bool>,
    #[serde(default)]
    feed_poll_interval_seconds: Option<u64>,
    #[serde(default)]
    bucket_seconds: Option<u64>,
    #[serde(default)]
    http_bind: Option<String>,
}

pub fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "setup config not present");
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub channel_id: String,
    pub write_api_key: Option<String>,
    pub read_api_key: Option<String>,
    pub api_base: String,
    pub min_write_interval_seconds: u64,
    pub field_map: FieldMap,
    pub request_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub enable_uploader: bool,
    pub upload_interval_seconds: u64,
    pub enable_feed: bool,
    pub feed_poll_interval_seconds: u64,
    pub feed_window_minutes: u64,
    pub feed_results: u32,
    pub bucket_seconds: u64,
    pub http_bind: String,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let lookup = |key: &str| env::var(key).ok();
        let overrides = setup_config_path(&lookup)
            .and_then(|path| load_setup_config_overrides(&path))
            .unwrap_or_default();
        Self::from_lookup(lookup, &overrides)
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        overrides: &SetupConfigOverrides,
    ) -> Result<Self> {
        let channel_id = non_empty(&lookup, "THINGSPEAK_CHANNEL_ID")
            .or_else(|| trimmed(overrides.channel_id.as_deref()))
            .context("THINGSPEAK_CHANNEL_ID is required (or channel_id in the setup config)")?;
        let write_api_key = non_empty(&lookup, "THINGSPEAK_WRITE_API_KEY")
            .or_else(|| trimmed(overrides.write_api_key.as_deref()));
        let read_api_key = non_empty(&lookup, "THINGSPEAK_READ_API_KEY")
            .or_else(|| trimmed(overrides.read_api_key.as_deref()));
        let api_base = non_empty(&lookup, "THINGSPEAK_API_BASE")
            .or_else(|| trimmed(overrides.api_base.as_deref()))
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let min_write_interval_seconds = env_u64(
            &lookup,
            "THINGSPEAK_MIN_WRITE_INTERVAL_SECONDS",
            overrides.min_write_interval_seconds.unwrap_or(15),
        )?;
        let field_map_raw = non_empty(&lookup, "THINGSPEAK_FIELD_MAP")
            .or_else(|| trimmed(overrides.field_map.as_deref()));
        let field_map = match field_map_raw {
            Some(raw) => FieldMap::parse(&raw).context("invalid THINGSPEAK_FIELD_MAP")?,
            None => FieldMap::default(),
        };

        let request_timeout_ms = env_u64(&lookup, "PIPELINE_REQUEST_TIMEOUT_MS", 3000)?;
        let retry_attempts = env_u64(&lookup, "PIPELINE_RETRY_ATTEMPTS", 3)?;
        let retry_attempts =
            u32::try_from(retry_attempts).context("PIPELINE_RETRY_ATTEMPTS is out of range")?;
        let retry_initial_ms = env_u64(&lookup, "PIPELINE_RETRY_INITIAL_MS", 1000)?;
        let retry_max_ms = env_u64(&lookup, "PIPELINE_RETRY_MAX_MS", 30_000)?;

        let enable_uploader = env_bool(
            &lookup,
            "PIPELINE_ENABLE_UPLOADER",
            overrides.enable_uploader.unwrap_or(true),
        )?;
        let upload_interval_seconds = env_u64(
            &lookup,
            "PIPELINE_UPLOAD_INTERVAL_SECONDS",
            overrides.upload_interval_seconds.unwrap_or(15),
        )?;
        let enable_feed = env_bool(
            &lookup,
            "PIPELINE_ENABLE_FEED",
            overrides.enable_feed.unwrap_or(true),
        )?;
        let feed_poll_interval_seconds = env_u64(
            &lookup,
            "PIPELINE_FEED_POLL_INTERVAL_SECONDS",
            overrides.feed_poll_interval_seconds.unwrap_or(15),
        )?;
        let feed_window_minutes = env_u64(&lookup, "PIPELINE_FEED_WINDOW_MINUTES", 60)?;
        let feed_results = env_u64(&lookup, "PIPELINE_FEED_RESULTS", 50)?;
        let feed_results = u32::try_from(feed_results.min(u64::from(MAX_READ_RESULTS)))
            .context("PIPELINE_FEED_RESULTS is out of range")?;
        let bucket_seconds = env_u64(
            &lookup,
            "PIPELINE_BUCKET_SECONDS",
            overrides.bucket_seconds.unwrap_or(60),
        )?;
        let http_bind = non_empty(&lookup, "PIPELINE_HTTP_BIND")
            .or_else(|| trimmed(overrides.http_bind.as_deref()))
            .unwrap_or_else(|| "127.0.0.1:8050".to_string());
        let otlp_endpoint = non_empty(&lookup, "OTEL_EXPORTER_OTLP_ENDPOINT");

        let config = Self {
            channel_id,
            write_api_key,
            read_api_key,
            api_base,
            min_write_interval_seconds,
            field_map,
            request_timeout_ms,
            retry_attempts,
            retry_initial_ms,
            retry_max_ms,
            enable_uploader,
            upload_interval_seconds,
            enable_feed,
            feed_poll_interval_seconds,
            feed_window_minutes,
            feed_results,
            bucket_seconds,
            http_bind,
            otlp_endpoint,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.min_write_interval_seconds == 0 {
            bail!("THINGSPEAK_MIN_WRITE_INTERVAL_SECONDS must be positive");
        }
        if self.request_timeout_ms == 0 {
            bail!("PIPELINE_REQUEST_TIMEOUT_MS must be positive");
        }
        if self.retry_attempts == 0 {
            bail!("PIPELINE_RETRY_ATTEMPTS must be at least 1");
        }
        if self.enable_uploader {
            if self.write_api_key.is_none() {
                bail!("THINGSPEAK_WRITE_API_KEY is required while the uploader is enabled");
            }
            if self.upload_interval_seconds == 0 {
                bail!("PIPELINE_UPLOAD_INTERVAL_SECONDS must be positive");
            }
        }
        if self.enable_feed {
            if self.read_api_key.is_none() {
                bail!("THINGSPEAK_READ_API_KEY is required while the feed is enabled");
            }
            if self.feed_window_minutes == 0 || self.feed_results == 0 {
                bail!("PIPELINE_FEED_WINDOW_MINUTES and PIPELINE_FEED_RESULTS must be positive");
            }
            if self.feed_window_minutes > MAX_FEED_WINDOW_MINUTES as u64 {
                bail!(
                    "PIPELINE_FEED_WINDOW_MINUTES must be at most {MAX_FEED_WINDOW_MINUTES}, got {}",
                    self.feed_window_minutes
                );
            }
            if self.bucket_seconds == 0 || self.bucket_seconds > self.feed_window_minutes * 60 {
                bail!(
                    "PIPELINE_BUCKET_SECONDS must be positive and no longer than the feed window, got {}",
                    self.bucket_seconds
                );
            }
            self.feed_settings()?
                .validate(&self.retry_policy())
                .context("invalid dashboard feed settings")?;
        }
        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            channel_id: self.channel_id.clone(),
            write_key: self.write_api_key.clone().unwrap_or_default(),
            read_key: self.read_api_key.clone().unwrap_or_default(),
            min_write_interval: Duration::from_secs(self.min_write_interval_seconds),
            field_map: self.field_map.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_attempts(self.retry_attempts)
            .with_delay(Duration::from_millis(self.retry_initial_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_seconds)
    }

    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_secs(self.feed_poll_interval_seconds)
    }

    pub fn feed_settings(&self) -> Result<FeedSettings> {
        let window = i64::try_from(self.feed_window_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .with_context(|| {
                format!("PIPELINE_FEED_WINDOW_MINUTES out of range: {}", self.feed_window_minutes)
            })?;
        let bucket_width = i64::try_from(self.bucket_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .with_context(|| {
                format!("PIPELINE_BUCKET_SECONDS out of range: {}", self.bucket_seconds)
            })?;
        Ok(FeedSettings {
            poll_interval: self.feed_poll_interval(),
            window,
            results: self.feed_results,
            bucket_width,
            request_timeout: self.request_timeout(),
        })
    }
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    trimmed(lookup(key).as_deref())
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    match non_empty(lookup, key) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{key} must be a non-negative integer (got {raw:?})")),
        None => Ok(default),
    }
}

fn env_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = non_empty(lookup, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{key} must be a boolean (got {raw:?})"),
    }
}
