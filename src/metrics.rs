//! Prometheus metrics with dependency injection for testability

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for recording metrics
pub trait MetricsRecorder: Send + Sync {
    /// Record a counter increment
    fn record_counter(&self, name: &'static str, labels: &[(&'static str, &str)], value: u64);

    /// Record a gauge value
    fn record_gauge(&self, name: &'static str, value: f64);

    /// Record a histogram value
    fn record_histogram(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64);
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production Prometheus metrics recorder
pub struct PrometheusRecorder;

impl MetricsRecorder for PrometheusRecorder {
    fn record_counter(&self, name: &'static str, labels: &[(&'static str, &str)], value: u64) {
        match labels.len() {
            0 => metrics::counter!(name).increment(value),
            1 => metrics::counter!(name, labels[0].0 => labels[0].1.to_string()).increment(value),
            _ => {
                metrics::counter!(name, labels[0].0 => labels[0].1.to_string(), labels[1].0 => labels[1].1.to_string()).increment(value)
            }
        }
    }

    fn record_gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name).set(value);
    }

    fn record_histogram(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        match labels.len() {
            0 => metrics::histogram!(name).record(value),
            1 => metrics::histogram!(name, labels[0].0 => labels[0].1.to_string()).record(value),
            _ => {
                metrics::histogram!(name, labels[0].0 => labels[0].1.to_string(), labels[1].0 => labels[1].1.to_string()).record(value)
            }
        }
    }
}

// ============================================================================
// Metrics Service
// ============================================================================

/// Metrics service with dependency injection
pub struct MetricsService {
    recorder: Arc<dyn MetricsRecorder>,
}

impl MetricsService {
    /// Create a new metrics service with the given recorder
    pub fn new(recorder: Arc<dyn MetricsRecorder>) -> Self {
        Self { recorder }
    }

    /// Record a proxied call starting against a backend
    pub fn record_call_started(&self, backend: &str) {
        self.recorder.record_counter(
            "grpc_relay_calls_started_total",
            &[("backend", backend)],
            1,
        );
    }

    /// Record a proxied call finishing with a terminal status code
    pub fn record_call_handled(&self, backend: &str, code: &str, elapsed: Duration) {
        self.recorder.record_counter(
            "grpc_relay_calls_handled_total",
            &[("backend", backend), ("code", code)],
            1,
        );
        self.recorder.record_histogram(
            "grpc_relay_call_duration_seconds",
            &[("backend", backend)],
            elapsed.as_secs_f64(),
        );
    }

    /// Record a new connection dialed to a backend
    pub fn record_backend_dial(&self, backend: &str) {
        self.recorder.record_counter(
            "grpc_relay_backend_dials_total",
            &[("backend", backend)],
            1,
        );
    }

    /// Update the pooled connection count gauge
    pub fn update_pool_connections(&self, count: usize) {
        self.recorder
            .record_gauge("grpc_relay_pool_connections", count as f64);
    }
}

// ============================================================================
// Global Instance
// ============================================================================

static METRICS_SERVICE: OnceLock<MetricsService> = OnceLock::new();

/// Initialize the global metrics service (should be called once at startup)
pub fn init_service(service: MetricsService) {
    METRICS_SERVICE.get_or_init(|| service);
}

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    init_service(MetricsService::new(Arc::new(PrometheusRecorder)));

    Ok(handle)
}

/// Record a proxied call starting (global accessor)
pub fn record_call_started(backend: &str) {
    if let Some(service) = METRICS_SERVICE.get() {
        service.record_call_started(backend);
    }
}

/// Record a proxied call finishing (global accessor)
pub fn record_call_handled(backend: &str, code: &str, elapsed: Duration) {
    if let Some(service) = METRICS_SERVICE.get() {
        service.record_call_handled(backend, code, elapsed);
    }
}

/// Record a backend dial (global accessor)
pub fn record_backend_dial(backend: &str) {
    if let Some(service) = METRICS_SERVICE.get() {
        service.record_backend_dial(backend);
    }
}

/// Update the pooled connection gauge (global accessor)
pub fn update_pool_connections(count: usize) {
    if let Some(service) = METRICS_SERVICE.get() {
        service.update_pool_connections(count);
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mocks::MockMetricsRecorder;

    #[test]
    fn test_record_call_started() {
        let mock = Arc::new(MockMetricsRecorder::new());
        let service = MetricsService::new(mock.clone());

        service.record_call_started("backendA");

        assert_eq!(mock.get_counter("grpc_relay_calls_started_total"), 1);
        assert!(mock.counter_has_label("grpc_relay_calls_started_total", "backend", "backendA"));
    }

    #[test]
    fn test_record_call_handled() {
        let mock = Arc::new(MockMetricsRecorder::new());
        let service = MetricsService::new(mock.clone());

        service.record_call_handled("backendA", "Ok", Duration::from_millis(25));
        service.record_call_handled("backendA", "Unavailable", Duration::from_millis(5));

        assert_eq!(mock.get_counter("grpc_relay_calls_handled_total"), 2);
        assert!(mock.counter_has_label("grpc_relay_calls_handled_total", "code", "Ok"));
        assert!(mock.counter_has_label(
            "grpc_relay_calls_handled_total",
            "code",
            "Unavailable"
        ));

        let histograms = mock.get_histograms();
        assert_eq!(histograms.len(), 2);
        assert_eq!(histograms[0].0, "grpc_relay_call_duration_seconds");
    }

    #[test]
    fn test_record_backend_dial_accumulates() {
        let mock = Arc::new(MockMetricsRecorder::new());
        let service = MetricsService::new(mock.clone());

        service.record_backend_dial("backendA");
        service.record_backend_dial("backendA");
        service.record_backend_dial("backendB");

        assert_eq!(mock.get_counter("grpc_relay_backend_dials_total"), 3);
        assert!(mock.counter_has_label("grpc_relay_backend_dials_total", "backend", "backendB"));
    }

    #[test]
    fn test_pool_gauge_updates() {
        let mock = Arc::new(MockMetricsRecorder::new());
        let service = MetricsService::new(mock.clone());

        service.update_pool_connections(5);
        assert_eq!(mock.get_gauge("grpc_relay_pool_connections"), 5.0);

        service.update_pool_connections(2);
        assert_eq!(mock.get_gauge("grpc_relay_pool_connections"), 2.0);
    }

    #[test]
    fn test_global_accessors_without_init_are_noops() {
        // The global service may or may not be initialized by other tests;
        // either way these must not panic.
        record_call_started("backendA");
        record_call_handled("backendA", "Ok", Duration::from_millis(1));
        record_backend_dial("backendA");
        update_pool_connections(0);
    }
}
