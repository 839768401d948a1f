//! Pipeline metrics.
//!
//! Only records; installing an exporter is the binary's job.

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const FETCH_DURATION_SECONDS: &str = "reframe_fetch_duration_seconds";
    pub const FETCH_TOTAL: &str = "reframe_fetch_total";
    pub const PROBE_DEGRADED_TOTAL: &str = "reframe_probe_degraded_total";
    pub const ENGINE_DURATION_SECONDS: &str = "reframe_engine_duration_seconds";
    pub const ENGINE_ATTEMPTS_TOTAL: &str = "reframe_engine_attempts_total";
    pub const CONVERSIONS_TOTAL: &str = "reframe_conversions_total";
}

/// Record an acquisition attempt (time to response headers).
pub fn record_fetch(duration_secs: f64, success: bool) {
    let labels = [("outcome", outcome(success).to_string())];
    counter!(names::FETCH_TOTAL, &labels).increment(1);
    histogram!(names::FETCH_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_probe_degraded() {
    counter!(names::PROBE_DEGRADED_TOTAL).increment(1);
}

/// Record one engine attempt at `tier`.
pub fn record_engine_attempt(tier: &str, duration_secs: f64, success: bool) {
    let labels = [
        ("tier", tier.to_string()),
        ("outcome", outcome(success).to_string()),
    ];
    counter!(names::ENGINE_ATTEMPTS_TOTAL, &labels).increment(1);
    histogram!(names::ENGINE_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a finished conversion and the tier that produced it (`failed` if none).
pub fn record_conversion(mode_used: &str) {
    counter!(names::CONVERSIONS_TOTAL, "mode_used" => mode_used.to_string()).increment(1);
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}
