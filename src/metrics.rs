//! Prometheus metrics (spec §10.5). Grounded directly on the teacher's
//! `metrics.rs`: the `MetricsRecorder`/`PrometheusHandle` setup and the
//! `/metrics` handler survive unchanged; the counter names are renamed
//! from MLS-specific to chat-delivery-specific.

use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
        metrics::describe_histogram!("http_request_duration_seconds", "HTTP request duration in seconds");
        metrics::describe_counter!("messages_sent_total", "Total number of messages authored");
        metrics::describe_counter!("messages_delivered_total", "Total number of per-recipient pushes delivered");
        metrics::describe_counter!("messages_dead_lettered_total", "Total number of delivery jobs dead-lettered after exhausting retries");
        metrics::describe_gauge!("connections_active", "Number of active websocket connections on this node");
        metrics::describe_gauge!("delivery_log_pending", "Number of entries currently pending acknowledgment in the delivery log");

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}

pub async fn track_request_metrics(req: axum::extract::Request, next: axum::middleware::Next) -> impl IntoResponse {
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    metrics::counter!("http_requests_total", 1);
    metrics::histogram!("http_request_duration_seconds", start.elapsed().as_secs_f64());
    response
}

pub fn record_message_sent() {
    metrics::counter!("messages_sent_total", 1);
}

pub fn record_message_delivered() {
    metrics::counter!("messages_delivered_total", 1);
}

pub fn record_message_dead_lettered() {
    metrics::counter!("messages_dead_lettered_total", 1);
}

pub fn set_active_connections(count: f64) {
    metrics::gauge!("connections_active", count);
}
