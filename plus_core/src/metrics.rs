//! Prometheus metrics recorded by the scaffolding layer.

use std::sync::OnceLock;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder once per process and return its handle.
pub fn install_recorder() -> PrometheusHandle {
    RECORDER
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(e) = metrics::set_global_recorder(recorder) {
                tracing::warn!("Failed to install Prometheus recorder: {}", e);
            }
            handle
        })
        .clone()
}

/// Record a finished HTTP request.
pub fn request_completed(method: &str, status: u16, duration_ms: f64) {
    counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("http_request_duration_ms", "method" => method.to_string()).record(duration_ms);
}

/// Record tables created by `create_all`.
pub fn tables_created(count: usize) {
    counter!("db_tables_created_total").increment(count as u64);
}

/// Record migrations applied by `upgrade`.
pub fn migrations_applied(count: usize) {
    counter!("db_migrations_applied_total").increment(count as u64);
}
