// crates/relay/src/metrics.rs
//! Prometheus metrics for the relay.
//!
//! Recording helpers are no-ops until [`init_metrics`] installs the global
//! recorder, so library code and tests can call them unconditionally.

use std::sync::OnceLock;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Returns `false` if one is already set.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("Failed to set global metrics recorder (already set)");
        return false;
    }
    if PROMETHEUS_HANDLE.set(handle).is_err() {
        tracing::warn!("Failed to store Prometheus handle (already set)");
    }

    describe_metrics();
    tracing::info!("Prometheus metrics initialized");
    true
}

fn describe_metrics() {
    describe_gauge!("relay_connected_sockets", "WebSocket clients currently connected");
    describe_counter!(
        "relay_updates_delivered_total",
        "Job updates sent straight to ready sockets"
    );
    describe_counter!(
        "relay_updates_buffered_total",
        "Job updates held for sockets still receiving their snapshot"
    );
    describe_counter!(
        "relay_updates_dropped_total",
        "Buffered job updates discarded when a pending buffer overflowed"
    );
    describe_counter!("relay_snapshots_total", "Team snapshots served");
    describe_histogram!(
        "relay_snapshot_duration_seconds",
        "Time spent building a team snapshot"
    );
    describe_counter!(
        "relay_invalid_messages_total",
        "Pub/sub messages that could not be decoded"
    );
}

/// Current metrics in Prometheus text format, or `None` before init.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// GET /metrics. 503 until the recorder is installed.
pub async fn metrics_handler() -> Response {
    match render_metrics() {
        Some(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Metrics not initialized").into_response(),
    }
}

pub fn set_connected(count: usize) {
    gauge!("relay_connected_sockets").set(count as f64);
}

pub fn record_routing(delivered: usize, buffered: usize, dropped: usize) {
    if delivered > 0 {
        counter!("relay_updates_delivered_total").increment(delivered as u64);
    }
    if buffered > 0 {
        counter!("relay_updates_buffered_total").increment(buffered as u64);
    }
    if dropped > 0 {
        counter!("relay_updates_dropped_total").increment(dropped as u64);
    }
}

pub fn record_snapshot(duration: Duration) {
    counter!("relay_snapshots_total").increment(1);
    histogram!("relay_snapshot_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_invalid_message() {
    counter!("relay_invalid_messages_total").increment(1);
}
