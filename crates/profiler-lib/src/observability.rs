//! Observability infrastructure for the profiling server
//!
//! Provides:
//! - Prometheus metrics (discovery latency, probe outcomes, sessions, captures, retention)
//! - Structured JSON logging with tracing for lifecycle events

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for discovery latency (in seconds)
const DISCOVERY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ProfilerMetricsInner> = OnceLock::new();

struct ProfilerMetricsInner {
    discovery_latency_seconds: Histogram,
    probes: IntCounterVec,
    liveness_cache_hits: IntCounter,
    active_sessions: IntGauge,
    sessions_started: IntCounter,
    session_failures: IntCounter,
    captures: IntCounterVec,
    artifacts_deleted: IntCounter,
}

impl ProfilerMetricsInner {
    fn new() -> Self {
        Self {
            discovery_latency_seconds: register_histogram!(
                "pprof_server_discovery_latency_seconds",
                "Time spent listing and classifying hosts in a namespace",
                DISCOVERY_BUCKETS.to_vec()
            )
            .expect("Failed to register discovery_latency_seconds"),

            probes: register_int_counter_vec!(
                "pprof_server_probes_total",
                "Liveness probes issued against candidate endpoints",
                &["outcome"]
            )
            .expect("Failed to register probes_total"),

            liveness_cache_hits: register_int_counter!(
                "pprof_server_liveness_cache_hits_total",
                "Classifications answered from the liveness cache"
            )
            .expect("Failed to register liveness_cache_hits_total"),

            active_sessions: register_int_gauge!(
                "pprof_server_active_sessions",
                "Interactive visualization sessions currently running"
            )
            .expect("Failed to register active_sessions"),

            sessions_started: register_int_counter!(
                "pprof_server_sessions_started_total",
                "Interactive visualization sessions started"
            )
            .expect("Failed to register sessions_started_total"),

            session_failures: register_int_counter!(
                "pprof_server_session_failures_total",
                "Sessions that exited abnormally before their deadline"
            )
            .expect("Failed to register session_failures_total"),

            captures: register_int_counter_vec!(
                "pprof_server_captures_total",
                "Snapshot captures by profile kind and outcome",
                &["kind", "outcome"]
            )
            .expect("Failed to register captures_total"),

            artifacts_deleted: register_int_counter!(
                "pprof_server_artifacts_deleted_total",
                "Artifacts removed by the retention sweep"
            )
            .expect("Failed to register artifacts_deleted_total"),
        }
    }
}

/// Server metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share
/// the same underlying metrics.
#[derive(Clone)]
pub struct ProfilerMetrics {
    _private: (),
}

impl Default for ProfilerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProfilerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilerMetrics").finish()
    }
}

impl ProfilerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ProfilerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ProfilerMetricsInner {
        GLOBAL_METRICS.get_or_init(ProfilerMetricsInner::new)
    }

    pub fn observe_discovery_latency(&self, duration_secs: f64) {
        self.inner().discovery_latency_seconds.observe(duration_secs);
    }

    /// Record the outcome of a liveness probe
    pub fn record_probe(&self, reachable: bool) {
        let outcome = if reachable { "reachable" } else { "unreachable" };
        self.inner().probes.with_label_values(&[outcome]).inc();
    }

    pub fn inc_liveness_cache_hits(&self) {
        self.inner().liveness_cache_hits.inc();
    }

    pub fn session_started(&self) {
        self.inner().sessions_started.inc();
        self.inner().active_sessions.inc();
    }

    pub fn session_finished(&self) {
        self.inner().active_sessions.dec();
    }

    pub fn inc_session_failures(&self) {
        self.inner().session_failures.inc();
    }

    /// Record the outcome of a snapshot capture
    pub fn record_capture(&self, kind: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.inner().captures.with_label_values(&[kind, outcome]).inc();
    }

    pub fn add_artifacts_deleted(&self, count: u64) {
        self.inner().artifacts_deleted.inc_by(count);
    }
}

/// Structured logger for server lifecycle events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log server startup
    pub fn log_startup(&self, version: &str, listen_port: u16, capture_enabled: bool) {
        info!(
            event = "server_started",
            instance = %self.instance,
            version = %version,
            listen_port = listen_port,
            capture_enabled = capture_enabled,
            "pprof server started"
        );
    }

    /// Log server shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "server_shutdown",
            instance = %self.instance,
            reason = %reason,
            "pprof server shutting down"
        );
    }

    /// Log the summary of one capture cycle
    pub fn log_capture_cycle(
        &self,
        groups_captured: usize,
        groups_skipped: usize,
        artifacts_written: usize,
        captures_failed: usize,
        artifacts_deleted: usize,
    ) {
        if captures_failed > 0 || groups_skipped > 0 {
            warn!(
                event = "capture_cycle",
                instance = %self.instance,
                groups_captured = groups_captured,
                groups_skipped = groups_skipped,
                artifacts_written = artifacts_written,
                captures_failed = captures_failed,
                artifacts_deleted = artifacts_deleted,
                "Capture cycle completed with failures"
            );
        } else {
            info!(
                event = "capture_cycle",
                instance = %self.instance,
                groups_captured = groups_captured,
                artifacts_written = artifacts_written,
                artifacts_deleted = artifacts_deleted,
                "Capture cycle completed"
            );
        }
    }
}
