use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    application::render::{
        METRIC_POOL_BACKLOG, METRIC_POOL_OCCUPIED, METRIC_RENDER_DURATION_MS,
        METRIC_RENDER_ERRORS_TOTAL, METRIC_RENDERS_TOTAL,
    },
    config::{LogFormat, LoggingSettings},
};

use super::error::InfraError;

pub const METRIC_TTS_REQUESTS_TOTAL: &str = "sonare_tts_requests_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Install the Prometheus recorder backing `/metrics`.
pub fn install_metrics_recorder() -> Result<PrometheusHandle, InfraError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| InfraError::metrics(err.to_string()))?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_gauge!(
            METRIC_POOL_OCCUPIED,
            Unit::Count,
            "Renderer slots currently running a task."
        );
        describe_gauge!(
            METRIC_POOL_BACKLOG,
            Unit::Count,
            "Render tasks waiting for a free slot."
        );
        describe_histogram!(
            METRIC_RENDER_DURATION_MS,
            Unit::Milliseconds,
            "Renderer invocation latency in milliseconds."
        );
        describe_counter!(
            METRIC_RENDERS_TOTAL,
            Unit::Count,
            "Total number of finished renders, labelled by result."
        );
        describe_counter!(
            METRIC_RENDER_ERRORS_TOTAL,
            Unit::Count,
            "Total number of rejected or failed render requests, labelled by kind."
        );
        describe_counter!(
            METRIC_TTS_REQUESTS_TOTAL,
            Unit::Count,
            "Total number of /tts requests, labelled by admission decision."
        );
    });
}
