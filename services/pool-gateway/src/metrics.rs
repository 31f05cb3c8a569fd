//! Prometheus metrics exposition
//!
//! Gateway metrics:
//!
//! - `gateway_requests_total` (counter): labels `route`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `route`
//! - `gateway_attempts_total` (counter): label `outcome`
//!   (`committed` / `retried` / `exhausted` / `fatal`)
//! - `pool_accounts` (gauge): label `state`, refreshed at scrape time
//! - `pool_requests_in_flight` (gauge)

use account_pool::PoolStats;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `gateway_request_duration_seconds` with explicit buckets so it
/// renders as a histogram (with `_bucket` lines for `histogram_quantile()`
/// queries) rather than the default summary. The top buckets cover long
/// streaming responses.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "gateway_request_duration_seconds".to_string(),
            ),
            &[
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
                300.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed request with route and status labels.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "gateway_requests_total",
        "route" => route,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "route" => route)
        .record(duration_secs);
}

/// Record one failover attempt outcome.
pub fn record_attempt(outcome: &'static str) {
    metrics::counter!("gateway_attempts_total", "outcome" => outcome).increment(1);
}

/// Request sample that records itself when dropped.
///
/// Streaming handlers return before the response body finishes, so they move
/// this timer into the body stream. The sample then spans the whole relay
/// rather than just dispatch, and it still lands when the client disconnects
/// mid-stream.
pub struct RequestTimer {
    route: &'static str,
    status: u16,
    started: Instant,
}

impl RequestTimer {
    pub fn new(route: &'static str, status: u16, started: Instant) -> Self {
        RequestTimer {
            route,
            status,
            started,
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request(self.route, self.status, self.started.elapsed().as_secs_f64());
    }
}

/// Refresh the pool gauges from a stats snapshot. Called by the `/metrics`
/// handler so scrapes always see current counts without a dedicated task.
pub fn set_pool_gauges(stats: &PoolStats) {
    metrics::gauge!("pool_accounts", "state" => "active").set(stats.active as f64);
    metrics::gauge!("pool_accounts", "state" => "cooling_down").set(stats.cooling_down as f64);
    metrics::gauge!("pool_accounts", "state" => "inactive").set(stats.inactive as f64);
    metrics::gauge!("pool_accounts", "state" => "pending").set(stats.pending as f64);
    metrics::gauge!("pool_accounts", "state" => "disabled").set(stats.disabled as f64);
    metrics::gauge!("pool_requests_in_flight").set(stats.in_flight as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        // When no recorder is installed, metrics calls are no-ops.
        record_request("/api/chat", 200, 0.05);
        record_attempt("committed");
        set_pool_gauges(&PoolStats::default());
    }

    /// Create an isolated recorder/handle pair for unit tests. Only one
    /// global recorder can exist per process, so tests use a local one.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "gateway_request_duration_seconds".to_string(),
                ),
                &[0.005, 0.05, 0.5, 5.0, 60.0, 300.0],
            )
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn request_counter_carries_route_and_status_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/api/chat", 200, 0.042);
        record_request("/api/chat/stream", 503, 1.5);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("route=\"/api/chat\""));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("status=\"503\""));
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "histogram must render _bucket lines, got:\n{output}"
        );
    }

    #[test]
    fn attempt_outcomes_render_separately() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_attempt("committed");
        record_attempt("retried");
        record_attempt("retried");

        let output = handle.render();
        assert!(output.contains("outcome=\"committed\""));
        assert!(output.contains("outcome=\"retried\""));
    }

    #[test]
    fn request_timer_records_only_when_dropped() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let timer = RequestTimer::new("/api/chat/stream", 200, Instant::now());
        assert!(
            !handle.render().contains("/api/chat/stream"),
            "no sample may land while the timer is live"
        );
        drop(timer);

        let output = handle.render();
        assert!(output.contains("route=\"/api/chat/stream\""), "got:\n{output}");
        assert!(output.contains("status=\"200\""));
    }

    #[test]
    fn pool_gauges_reflect_stats() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let stats = PoolStats {
            total: 5,
            active: 2,
            cooling_down: 1,
            inactive: 1,
            pending: 0,
            disabled: 1,
            in_flight: 3,
            total_requests: 40,
            total_failures: 4,
        };
        set_pool_gauges(&stats);

        let output = handle.render();
        assert!(output.contains("pool_accounts{state=\"active\"} 2"));
        assert!(output.contains("pool_accounts{state=\"disabled\"} 1"));
        assert!(output.contains("pool_requests_in_flight 3"));
    }
}
