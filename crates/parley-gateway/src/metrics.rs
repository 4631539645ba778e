//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

/// Record the outcome of an `init` request ("ok" or an error kind).
pub fn record_init(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("session_inits_total", &labels).increment(1);
}

pub fn record_deinit() {
    metrics::counter!("session_deinits_total").increment(1);
}

pub fn set_sessions_active(count: usize) {
    metrics::gauge!("sessions_active").set(count as f64);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        // The metrics crate falls back to a no-op recorder.
        record_init("ok");
        record_deinit();
        set_sessions_active(3);
        record_error("transport");
    }
}
