//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "reframe_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "reframe_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "reframe_http_requests_in_flight";

    // Disposition metrics
    pub const OUTPUTS_DISPOSED_TOTAL: &str = "reframe_outputs_disposed_total";
    pub const OUTPUT_BYTES: &str = "reframe_output_bytes";
    pub const STORE_UPLOAD_DURATION_SECONDS: &str = "reframe_store_upload_duration_seconds";

    // Rate limiting metrics
    pub const RATE_LIMIT_HITS_TOTAL: &str = "reframe_rate_limit_hits_total";
}

/// Known route templates; anything else is bucketed to keep label cardinality bounded.
const KNOWN_PATHS: &[&str] = &["/api/convert", "/health", "/healthz", "/ready", "/metrics"];

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record where a finished output went (`inline` or `stored`).
pub fn record_disposition(disposition: &str, size: u64) {
    let labels = [("disposition", disposition.to_string())];
    counter!(names::OUTPUTS_DISPOSED_TOTAL, &labels).increment(1);
    histogram!(names::OUTPUT_BYTES, &labels).record(size as f64);
}

/// Record object-store upload duration.
pub fn record_store_upload(duration_secs: f64, success: bool) {
    let labels = [("success", success.to_string())];
    histogram!(names::STORE_UPLOAD_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", sanitize_path(endpoint))];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Sanitize path for metrics labels.
fn sanitize_path(path: &str) -> String {
    let trimmed = match path.trim_end_matches('/') {
        "" => "/",
        p => p,
    };
    if KNOWN_PATHS.contains(&trimmed) {
        trimmed.to_string()
    } else {
        "other".to_string()
    }
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
