//! Prometheus metrics recorder and `/metrics` endpoint plumbing.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Must be called once at server startup, before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

// Metric name constants to avoid typos across crates.

/// RPC requests accepted (counter).
pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
/// RPC requests that returned an error response (counter).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// Event streams opened (counter).
pub const EVENT_STREAMS_TOTAL: &str = "event_streams_total";
/// Event streams currently connected (gauge).
pub const EVENT_STREAMS_ACTIVE: &str = "event_streams_active";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_render() {
        // Build a recorder + handle without a global install, so tests don't
        // conflict over the recorder slot.
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_snake_case() {
        for name in [
            RPC_REQUESTS_TOTAL,
            RPC_ERRORS_TOTAL,
            EVENT_STREAMS_TOTAL,
            EVENT_STREAMS_ACTIVE,
        ] {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
