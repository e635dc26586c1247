//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `route`, `status`
//! - `proxy_request_duration_seconds` (histogram): label `route`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `proxy_failovers_total` (counter): label `outcome`
//!
//! The key pool crate adds `key_pool_selections_total` and
//! `key_pool_exhausted_total` through the same recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Upper bound is the default upstream timeout; streamed completions can run
/// that long.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `proxy_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram (with `_bucket` lines) rather than the default summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed request. For streamed responses the duration covers
/// time to headers, not the whole stream.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("proxy_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "route" => route).record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type).increment(1);
}

/// Record the outcome of a 429 failover attempt.
pub fn record_failover(outcome: &'static str) {
    metrics::counter!("proxy_failovers_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("chat_completions", 200, 0.05);
        record_upstream_error("timeout");
        record_failover("succeeded");
    }

    /// Isolated recorder/handle pair. `install_recorder()` can only succeed
    /// once per process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("chat_completions", 200, 0.042);
        record_request("models", 429, 0.001);

        let output = handle.render();
        assert!(output.contains("proxy_requests_total"));
        assert!(output.contains("route=\"chat_completions\""));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("route=\"models\""));
        assert!(output.contains("status=\"429\""));
        assert!(
            output.contains("proxy_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
    }

    #[test]
    fn upstream_errors_and_failovers_carry_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("timeout");
        record_upstream_error("rate_limited");
        record_failover("no_key");

        let output = handle.render();
        assert!(output.contains("error_type=\"timeout\""));
        assert!(output.contains("error_type=\"rate_limited\""));
        assert!(output.contains("proxy_failovers_total"));
        assert!(output.contains("outcome=\"no_key\""));
    }

    #[test]
    fn histogram_buckets_cover_upstream_timeout_range() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("models", 200, 0.003);

        let output = handle.render();
        assert!(output.contains("le=\"0.005\""), "5ms bucket must exist");
        assert!(output.contains("le=\"60\""));
        assert!(output.contains("le=\"300\""), "300s bucket must exist");
        assert!(output.contains("le=\"+Inf\""));
    }
}
