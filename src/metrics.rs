//! Prometheus metrics for kvnode.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "kvnode_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "kvnode_http_request_duration_seconds";

/// Client proposals submitted to consensus (counter). Labels: outcome.
pub const PROPOSALS_TOTAL: &str = "kvnode_proposals_total";

/// Committed entries applied to the store (counter).
pub const ENTRIES_APPLIED_TOTAL: &str = "kvnode_entries_applied_total";

/// Snapshots written to disk (counter).
pub const SNAPSHOTS_SAVED_TOTAL: &str = "kvnode_snapshots_saved_total";

/// Consensus messages sent to peers (counter). Labels: status.
pub const PEER_MESSAGES_SENT_TOTAL: &str = "kvnode_peer_messages_sent_total";

/// Requests relayed by the proxy (counter). Labels: status.
pub const PROXY_REQUESTS_TOTAL: &str = "kvnode_proxy_requests_total";

/// Whether this node currently knows a leader (gauge, 0 or 1).
pub const HAS_LEADER: &str = "kvnode_has_leader";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
///
/// If some other recorder is already installed the handle still renders,
/// it just never sees any samples.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("A metrics recorder is already installed");
        }
        handle
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(PROPOSALS_TOTAL, "Client proposals submitted to consensus");
    describe_counter!(ENTRIES_APPLIED_TOTAL, "Committed entries applied to the store");
    describe_counter!(SNAPSHOTS_SAVED_TOTAL, "Snapshots written to disk");
    describe_counter!(PEER_MESSAGES_SENT_TOTAL, "Consensus messages sent to peers");
    describe_counter!(PROXY_REQUESTS_TOTAL, "Requests relayed by the proxy");
    describe_gauge!(HAS_LEADER, "Whether this node currently knows a leader");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// Key names would otherwise explode label cardinality.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/v2/keys/foo/bar` -> `/v2/keys/{key}`
/// - `/anything/else` -> `/{other}`
fn normalize_path(path: &str) -> String {
    match path {
        "/health" | "/metrics" | "/version" | "/raft" | "/v2/machines" | "/v2/keys" => {
            path.to_string()
        }
        _ if path.starts_with("/v2/keys/") => "/v2/keys/{key}".to_string(),
        _ => "/{other}".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = init_metrics().render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------
