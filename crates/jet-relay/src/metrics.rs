//! Metrics collection and export

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

use crate::forwarder::{Direction, TerminationReason};

/// Relay metrics
pub struct RelayMetrics {
    active_associations: Gauge,
    associations_total: Counter,
    negotiation_failures: CounterVec,
    active_sessions: Gauge,
    sessions_total: Counter,
    session_terminations: CounterVec,
    session_duration: Histogram,
    bytes_forwarded: CounterVec,
    token_rejections: CounterVec,
    jrl_updates: Counter,
    bandwidth_usage: Gauge,
    registry: Registry,

    start_time: Instant,
    last_update_time: Mutex<Instant>,
    last_bytes_count: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let active_associations = Gauge::with_opts(Opts::new(
            "jet_relay_active_associations",
            "Number of associations currently negotiating or relaying",
        ))?;
        registry.register(Box::new(active_associations.clone()))?;

        let associations_total = Counter::with_opts(Opts::new(
            "jet_relay_associations_total",
            "Total number of associations opened",
        ))?;
        registry.register(Box::new(associations_total.clone()))?;

        let negotiation_failures = CounterVec::new(
            Opts::new(
                "jet_relay_negotiation_failures_total",
                "Associations closed before relaying started",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(negotiation_failures.clone()))?;

        let active_sessions = Gauge::with_opts(Opts::new(
            "jet_relay_active_sessions",
            "Number of sessions currently relaying",
        ))?;
        registry.register(Box::new(active_sessions.clone()))?;

        let sessions_total = Counter::with_opts(Opts::new(
            "jet_relay_sessions_total",
            "Total number of relay sessions started",
        ))?;
        registry.register(Box::new(sessions_total.clone()))?;

        let session_terminations = CounterVec::new(
            Opts::new(
                "jet_relay_session_terminations_total",
                "Relay sessions ended, by termination reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(session_terminations.clone()))?;

        let session_duration = Histogram::with_opts(HistogramOpts::new(
            "jet_relay_session_duration_seconds",
            "Relay session duration in seconds",
        ))?;
        registry.register(Box::new(session_duration.clone()))?;

        let bytes_forwarded = CounterVec::new(
            Opts::new("jet_relay_bytes_forwarded_total", "Total bytes forwarded"),
            &["direction"],
        )?;
        registry.register(Box::new(bytes_forwarded.clone()))?;

        let token_rejections = CounterVec::new(
            Opts::new(
                "jet_relay_token_rejections_total",
                "Tokens rejected during validation",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(token_rejections.clone()))?;

        let jrl_updates = Counter::with_opts(Opts::new(
            "jet_relay_jrl_updates_total",
            "Revocation lists accepted",
        ))?;
        registry.register(Box::new(jrl_updates.clone()))?;

        let bandwidth_usage = Gauge::with_opts(Opts::new(
            "jet_relay_bandwidth_usage_bytes_per_sec",
            "Current bandwidth usage in bytes per second",
        ))?;
        registry.register(Box::new(bandwidth_usage.clone()))?;

        Ok(Self {
            active_associations,
            associations_total,
            negotiation_failures,
            active_sessions,
            sessions_total,
            session_terminations,
            session_duration,
            bytes_forwarded,
            token_rejections,
            jrl_updates,
            bandwidth_usage,
            registry,
            start_time: Instant::now(),
            last_update_time: Mutex::new(Instant::now()),
            last_bytes_count: AtomicU64::new(0),
        })
    }

    pub fn record_association_opened(&self) {
        self.associations_total.inc();
        self.active_associations.inc();
    }

    pub fn record_association_closed(&self) {
        self.active_associations.dec();
    }

    pub fn record_negotiation_failure(&self, reason: &str) {
        self.negotiation_failures.with_label_values(&[reason]).inc();
    }

    pub fn record_session_started(&self) {
        self.sessions_total.inc();
        self.active_sessions.inc();
    }

    pub fn record_session_finished(&self, reason: TerminationReason, duration: Duration) {
        self.active_sessions.dec();
        self.session_terminations
            .with_label_values(&[reason.as_str()])
            .inc();
        self.session_duration.observe(duration.as_secs_f64());
    }

    pub fn record_forward(&self, direction: Direction, bytes: usize) {
        self.bytes_forwarded
            .with_label_values(&[direction.as_str()])
            .inc_by(bytes as f64);
    }

    pub fn record_token_rejected(&self, reason: &str) {
        self.token_rejections.with_label_values(&[reason]).inc();
    }

    pub fn record_jrl_update(&self) {
        self.jrl_updates.inc();
    }

    pub fn active_sessions(&self) -> f64 {
        self.active_sessions.get()
    }

    pub fn bytes_forwarded(&self) -> f64 {
        Direction::ALL
            .iter()
            .map(|d| self.bytes_forwarded.with_label_values(&[d.as_str()]).get())
            .sum()
    }

    pub fn token_rejections(&self, reason: &str) -> f64 {
        self.token_rejections.with_label_values(&[reason]).get()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Update the bandwidth gauge from the byte counters.
    /// Should be called periodically.
    pub fn update_rate_calc(&self) {
        let now = Instant::now();
        let mut last_time = self.last_update_time.lock();
        let elapsed = now.duration_since(*last_time);

        if elapsed.as_secs_f64() < 1.0 {
            return;
        }

        let current_bytes = self.bytes_forwarded() as u64;
        let last_bytes = self.last_bytes_count.swap(current_bytes, Ordering::Relaxed);
        let diff = current_bytes.saturating_sub(last_bytes);
        self.bandwidth_usage.set(diff as f64 / elapsed.as_secs_f64());

        *last_time = now;
    }

    /// Export Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}
