//! Structured observability for the SelfStart control plane.
//!
//! Provides:
//! - [`OperationsMetrics`] — atomic counters for all five control loops
//! - [`MetricsExporter`] — Prometheus text format export

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

// ─── Atomic counter ───────────────────────────────────────────────────────────

/// A thread-safe u64 counter backed by an atomic.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment the counter by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current counter value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ─── Operations metrics ───────────────────────────────────────────────────────

/// Atomic operation counters for the SelfStart control loops.
///
/// All counters are thread-safe and shared via [`Arc`].
#[derive(Debug, Default)]
pub struct OperationsMetrics {
    /// Discovery cycles completed.
    pub discovery_cycles_total: Counter,
    /// Discovery cycles that hit a runtime or store error.
    pub discovery_errors: Counter,
    /// Health probes issued (discovery + orchestrator + proxy).
    pub health_probes_total: Counter,
    /// Container start attempts.
    pub container_starts_total: Counter,
    /// Container starts that ended in error.
    pub container_start_errors: Counter,
    /// Container stop operations.
    pub container_stops_total: Counter,
    /// Requests handled by the reverse proxy.
    pub proxy_requests_total: Counter,
    /// Proxied requests that failed on all attempts.
    pub proxy_request_errors: Counter,
    /// Retries onto another backend.
    pub proxy_retries_total: Counter,
    /// Circuit breakers tripped open.
    pub circuit_opens_total: Counter,
    /// Automatic scale-up actions.
    pub scale_ups_total: Counter,
    /// Automatic scale-down actions.
    pub scale_downs_total: Counter,
    /// Scale actions that failed.
    pub scaling_errors: Counter,
    /// Shutdown actions executed.
    pub shutdowns_executed_total: Counter,
    /// Shutdown evaluations skipped by a protection predicate.
    pub shutdowns_protected_total: Counter,
    /// Hook bus publishes.
    pub hook_publishes_total: Counter,
}

impl OperationsMetrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start_error(&self) {
        self.container_start_errors.inc();
        warn!(
            counter = "container_start_errors",
            value = self.container_start_errors.get(),
            "container start failed"
        );
    }

    pub fn record_circuit_open(&self) {
        self.circuit_opens_total.inc();
        warn!(
            counter = "circuit_opens_total",
            value = self.circuit_opens_total.get(),
            "circuit breaker opened"
        );
    }

    pub fn record_scaling_error(&self) {
        self.scaling_errors.inc();
        warn!(
            counter = "scaling_errors",
            value = self.scaling_errors.get(),
            "scale action failed"
        );
    }
}

// ─── Metrics exporter (Prometheus text format) ────────────────────────────────

/// Exports [`OperationsMetrics`] in Prometheus text format.
pub struct MetricsExporter {
    metrics: Arc<OperationsMetrics>,
    /// Metric name prefix (default: `selfstart`).
    prefix: String,
}

impl MetricsExporter {
    pub fn new(metrics: Arc<OperationsMetrics>) -> Self {
        Self {
            metrics,
            prefix: "selfstart".to_string(),
        }
    }

    pub fn with_prefix(metrics: Arc<OperationsMetrics>, prefix: impl Into<String>) -> Self {
        Self {
            metrics,
            prefix: prefix.into(),
        }
    }

    /// Render all counters with `# HELP`, `# TYPE` and value lines.
    pub fn render(&self) -> String {
        let m = &self.metrics;
        let rows: [(&str, &str, u64); 17] = [
            (
                "discovery_cycles_total",
                "Discovery cycles completed",
                m.discovery_cycles_total.get(),
            ),
            (
                "discovery_errors",
                "Discovery cycles that hit an error",
                m.discovery_errors.get(),
            ),
            (
                "health_probes_total",
                "Health probes issued",
                m.health_probes_total.get(),
            ),
            (
                "container_starts_total",
                "Container start attempts",
                m.container_starts_total.get(),
            ),
            (
                "container_start_errors",
                "Container starts that ended in error",
                m.container_start_errors.get(),
            ),
            (
                "container_stops_total",
                "Container stop operations",
                m.container_stops_total.get(),
            ),
            (
                "proxy_requests_total",
                "Requests handled by the reverse proxy",
                m.proxy_requests_total.get(),
            ),
            (
                "proxy_request_errors",
                "Proxied requests that failed on all attempts",
                m.proxy_request_errors.get(),
            ),
            (
                "proxy_retries_total",
                "Retries onto another backend",
                m.proxy_retries_total.get(),
            ),
            (
                "circuit_opens_total",
                "Circuit breakers tripped open",
                m.circuit_opens_total.get(),
            ),
            (
                "scale_ups_total",
                "Automatic scale-up actions",
                m.scale_ups_total.get(),
            ),
            (
                "scale_downs_total",
                "Automatic scale-down actions",
                m.scale_downs_total.get(),
            ),
            (
                "scaling_errors",
                "Scale actions that failed",
                m.scaling_errors.get(),
            ),
            (
                "shutdowns_executed_total",
                "Shutdown actions executed",
                m.shutdowns_executed_total.get(),
            ),
            (
                "shutdowns_protected_total",
                "Shutdown evaluations skipped by protection",
                m.shutdowns_protected_total.get(),
            ),
            (
                "hook_publishes_total",
                "Hook bus publishes",
                m.hook_publishes_total.get(),
            ),
            (
                "health_checks_total",
                "Alias of health_probes_total kept for dashboards",
                m.health_probes_total.get(),
            ),
        ];

        let mut out = String::new();
        for (name, help, value) in rows {
            self.write_counter(&mut out, name, help, value);
        }
        out
    }

    fn write_counter(&self, out: &mut String, name: &str, help: &str, value: u64) {
        let p = &self.prefix;
        out.push_str(&format!("# HELP {p}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {p}_{name} counter\n"));
        out.push_str(&format!("{p}_{name} {value}\n"));
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
