use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

pub struct Metrics {
    registry: Registry,

    // Audit metrics
    pub requests_recorded: IntCounter,
    pub responses_completed: IntCounter,
    pub completions_dropped: IntCounter,
    pub audit_write_errors: IntCounter,

    // Session metrics
    pub sessions_total: IntCounter,
    pub session_failures: IntCounter,
    pub active_sessions: IntGauge,

    // Certificate metrics
    pub leaf_certificates_issued: IntCounter,

    // Upstream metrics
    pub upstream_latency: Histogram,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_recorded = IntCounter::new(
            "agent_netlog_requests_recorded_total",
            "Total number of requests recorded in the audit log",
        )?;
        let responses_completed = IntCounter::new(
            "agent_netlog_responses_completed_total",
            "Total number of responses correlated with a recorded request",
        )?;
        let completions_dropped = IntCounter::new(
            "agent_netlog_completions_dropped_total",
            "Responses whose request was no longer in the working set",
        )?;
        let audit_write_errors = IntCounter::new(
            "agent_netlog_audit_write_errors_total",
            "Total number of failed journal appends",
        )?;

        let sessions_total = IntCounter::new(
            "agent_netlog_sessions_total",
            "Total number of tunnel sessions requested",
        )?;
        let session_failures = IntCounter::new(
            "agent_netlog_session_failures_total",
            "Total number of tunnel sessions closed on an error",
        )?;
        let active_sessions = IntGauge::new(
            "agent_netlog_active_sessions",
            "Number of tunnel sessions currently open",
        )?;

        let leaf_certificates_issued = IntCounter::new(
            "agent_netlog_leaf_certificates_issued_total",
            "Total number of leaf certificates minted",
        )?;

        let upstream_latency = Histogram::with_opts(HistogramOpts::new(
            "agent_netlog_upstream_latency_seconds",
            "Time from forwarding a request until its response body was read",
        ))?;

        // Register all metrics
        registry.register(Box::new(requests_recorded.clone()))?;
        registry.register(Box::new(responses_completed.clone()))?;
        registry.register(Box::new(completions_dropped.clone()))?;
        registry.register(Box::new(audit_write_errors.clone()))?;
        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(session_failures.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(leaf_certificates_issued.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;

        Ok(Self {
            registry,
            requests_recorded,
            responses_completed,
            completions_dropped,
            audit_write_errors,
            sessions_total,
            session_failures,
            active_sessions,
            leaf_certificates_issued,
            upstream_latency,
        })
    }

    pub fn record_completion(&self, correlated: bool) {
        if correlated {
            self.responses_completed.inc();
        } else {
            self.completions_dropped.inc();
        }
    }

    pub fn session_opened(&self) {
        self.sessions_total.inc();
        self.active_sessions.inc();
    }

    pub fn session_closed(&self, failed: bool) {
        self.active_sessions.dec();
        if failed {
            self.session_failures.inc();
        }
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather_metrics(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Observes upstream latency when dropped.
pub struct UpstreamTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl UpstreamTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }
}

impl Drop for UpstreamTimer {
    fn drop(&mut self) {
        self.metrics
            .upstream_latency
            .observe(self.start.elapsed().as_secs_f64());
    }
}
