// Telemetry module for structured logging and metrics

use crate::models::JobState;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting on stderr
///
/// `RUST_LOG` takes precedence over the configured level when set.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, "Structured logging initialized");

    Ok(())
}

/// Initialize the Prometheus metrics exporter
///
/// Metrics are always recorded; without an exporter they are discarded.
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "foreman_jobs_dispatched_total",
        "Total number of dispatch requests accepted into the registry"
    );
    describe_counter!(
        "foreman_jobs_completed_total",
        "Total number of jobs that reached a terminal state"
    );
    describe_counter!(
        "foreman_updates_sent_total",
        "Detached job updates delivered to the dispatcher"
    );
    describe_counter!(
        "foreman_updates_failed_total",
        "Detached job updates that could not be delivered"
    );
    describe_histogram!(
        "foreman_job_duration_seconds",
        "Duration of job executions in seconds"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_job_dispatched(detached: bool) {
    counter!("foreman_jobs_dispatched_total", "detached" => detached.to_string()).increment(1);
}

#[inline]
pub fn record_job_completed(state: JobState) {
    counter!("foreman_jobs_completed_total", "status" => state.to_string()).increment(1);
}

#[inline]
pub fn record_job_duration(duration_seconds: f64) {
    histogram!("foreman_job_duration_seconds").record(duration_seconds);
}

#[inline]
pub fn record_update_delivery(delivered: bool) {
    if delivered {
        counter!("foreman_updates_sent_total").increment(1);
    } else {
        counter!("foreman_updates_failed_total").increment(1);
    }
}
