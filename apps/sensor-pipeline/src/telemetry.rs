use anyhow::{bail, Context, Result};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime::Tokio, trace::Config as TraceConfig, Resource};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use url::Url;

pub const SERVICE_NAME: &str = "sensor-pipeline";
const DEFAULT_FILTER: &str = "info,sensor_pipeline=info";
const TRACES_PATH: &str = "/v1/traces";

/// Installs the global subscriber: `RUST_LOG` filtering, fmt output, and a
/// batched OTLP/HTTP span exporter when `otlp_endpoint` is set. Spans carry
/// the channel id so traces from several benches can be told apart.
pub fn init(otlp_endpoint: Option<&str>, channel_id: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let otel_layer = match otlp_endpoint.map(traces_endpoint).transpose()?.flatten() {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint.to_string());
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(TraceConfig::default().with_resource(resource(channel_id)))
                .install_batch(Tokio)
                .context("failed to install the OTLP trace pipeline")?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .context("tracing subscriber already installed")?;
    Ok(())
}

fn resource(channel_id: &str) -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new("thingspeak.channel_id", channel_id.trim().to_string()),
    ])
}

/// Resolves a collector address to its OTLP/HTTP traces URL. A bare
/// `http://host:4318` gains `/v1/traces`; a blank value disables export.
pub fn traces_endpoint(raw: &str) -> Result<Option<Url>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let mut url = Url::parse(raw).with_context(|| format!("invalid OTLP endpoint {raw:?}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("OTLP endpoint must be http or https, got {}", url.scheme());
    }
    if !url.path().trim_end_matches('/').ends_with(TRACES_PATH) {
        let path = format!("{}{TRACES_PATH}", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    Ok(Some(url))
}
