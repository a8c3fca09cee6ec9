use super::{ChannelClient, ChannelConfig, ChannelError, RawRecord, ReadWindow, WriteReceipt};
use crate::reading::Reading;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE: &str = "https://api.thingspeak.com";

const STORE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const WRITE_REFUSED_BODY: &str = "0";
const READ_DENIED_BODY: &str = "-1";

#[derive(Debug, Deserialize)]
struct WriteResponse {
    entry_id: u64,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    channel: Option<ChannelMeta>,
    #[serde(default)]
    feeds: Vec<FeedEntry>,
}

#[derive(Debug, Deserialize)]
struct ChannelMeta {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    last_entry_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    #[serde(default)]
    entry_id: Option<u64>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    field1: Option<JsonValue>,
    #[serde(default)]
    field2: Option<JsonValue>,
    #[serde(default)]
    field3: Option<JsonValue>,
    #[serde(default)]
    field4: Option<JsonValue>,
}

impl From<FeedEntry> for RawRecord {
    fn from(entry: FeedEntry) -> Self {
        RawRecord {
            entry_id: entry.entry_id,
            created_at: entry.created_at,
            fields: [
                raw_field(entry.field1),
                raw_field(entry.field2),
                raw_field(entry.field3),
                raw_field(entry.field4),
            ],
        }
    }
}

fn raw_field(value: Option<JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

/// What the read key resolves to on the store side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub last_entry_id: Option<u64>,
}

#[derive(Clone)]
pub struct HttpChannelClient {
    http: Client,
    base: Url,
}

impl HttpChannelClient {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Self::with_client(http, api_base)
    }

    pub fn with_client(http: Client, api_base: &str) -> Result<Self> {
        let mut base = Url::parse(api_base.trim())
            .with_context(|| format!("invalid store base URL {api_base:?}"))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("store base URL {api_base:?} cannot carry a path");
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { http, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChannelError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ChannelError::Network("store base URL cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch_feed(
        &self,
        config: &ChannelConfig,
        window: &ReadWindow,
    ) -> Result<FeedResponse, ChannelError> {
        let mut url = self.endpoint(&["channels", config.channel_id.trim(), "feeds.json"])?;
        {
            let mut query = url.query_pairs_mut();
            if !config.read_key.is_empty() {
                query.append_pair("api_key", &config.read_key);
            }
            query.append_pair("results", &window.limit.to_string());
            if let Some(start) = window.start {
                query.append_pair("start", &start.format(STORE_TIME_FORMAT).to_string());
            }
            if let Some(end) = window.end {
                query.append_pair("end", &end.format(STORE_TIME_FORMAT).to_string());
            }
        }

        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if body.trim() == READ_DENIED_BODY {
            return Err(ChannelError::Auth(
                "read key rejected for this channel".to_string(),
            ));
        }
        if let Some(err) = classify_status(status, &body) {
            return Err(err);
        }

        serde_json::from_str(&body)
            .map_err(|err| ChannelError::Network(format!("unexpected feed body: {err}")))
    }

    /// Resolves the channel behind the configured read key. Used at startup to
    /// catch a read key that belongs to a different channel.
    pub async fn channel_info(&self, config: &ChannelConfig) -> Result<ChannelInfo, ChannelError> {
        let feed = self.fetch_feed(config, &ReadWindow::latest(1)).await?;
        let meta = feed.channel;
        Ok(ChannelInfo {
            id: meta.as_ref().and_then(|m| m.id),
            name: meta.as_ref().and_then(|m| m.name.clone()),
            last_entry_id: meta.as_ref().and_then(|m| m.last_entry_id),
        })
    }
}

#[async_trait]
impl ChannelClient for HttpChannelClient {
    async fn write(
        &self,
        config: &ChannelConfig,
        reading: &Reading,
    ) -> Result<WriteReceipt, ChannelError> {
        let url = self.endpoint(&["update.json"])?;
        let mut form: Vec<(&str, String)> = Vec::with_capacity(6);
        form.push(("api_key", config.write_key.clone()));
        for (slot, value) in reading.populated() {
            form.push((slot.field_key(), value.to_string()));
        }
        form.push((
            "created_at",
            reading.timestamp().to_rfc3339_opts(SecondsFormat::Secs, true),
        ));

        let response = self.http.post(url).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        match classify_status(status, &body) {
            Some(ChannelError::NotFound) => {
                return Err(ChannelError::Auth(
                    "write key does not match any channel".to_string(),
                ))
            }
            Some(err) => return Err(err),
            None => {}
        }

        parse_write_body(&body)
    }

    async fn read(
        &self,
        config: &ChannelConfig,
        window: &ReadWindow,
    ) -> Result<Vec<RawRecord>, ChannelError> {
        let feed = self.fetch_feed(config, window).await?;
        if feed.feeds.is_empty() {
            return Err(ChannelError::NotFound);
        }
        Ok(feed.feeds.into_iter().map(RawRecord::from).collect())
    }
}

fn classify_status(status: StatusCode, body: &str) -> Option<ChannelError> {
    if status.is_success() {
        return None;
    }
    let detail = body.trim();
    let detail = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", truncate(detail, 200))
    };
    Some(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChannelError::Auth(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ChannelError::InvalidField(detail)
        }
        StatusCode::NOT_FOUND => ChannelError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ChannelError::RateLimited,
        _ => ChannelError::Network(detail),
    })
}

fn parse_write_body(body: &str) -> Result<WriteReceipt, ChannelError> {
    let trimmed = body.trim();
    if trimmed == WRITE_REFUSED_BODY {
        return Err(ChannelError::RateLimited);
    }
    if let Ok(entry_id) = trimmed.parse::<u64>() {
        return Ok(WriteReceipt {
            entry_id,
            created_at: None,
        });
    }
    let parsed: WriteResponse = serde_json::from_str(trimmed)
        .map_err(|err| ChannelError::Network(format!("unexpected write response: {err}")))?;
    if parsed.entry_id == 0 {
        return Err(ChannelError::RateLimited);
    }
    Ok(WriteReceipt {
        entry_id: parsed.entry_id,
        created_at: parsed
            .created_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
