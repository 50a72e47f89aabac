//! Prometheus metrics for the check relay.
//!
//! Counters and gauges for connection health per role, published messages
//! and consumed deliveries.

use prometheus::{
    Counter, CounterVec, Histogram, HistogramOpts, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Relay metrics collection.
pub struct RelayMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Connect attempts by role.
    pub connect_attempts: CounterVec,

    /// Failed connect attempts by role and failing step.
    pub connect_failures: CounterVec,

    /// 1 while the role holds a live connection.
    pub connected: IntGaugeVec,

    /// Messages published.
    pub published_total: Counter,

    /// Publish attempts that failed.
    pub publish_errors: Counter,

    /// Time spent writing one message.
    pub publish_duration_seconds: Histogram,

    /// Body bytes published.
    pub bytes_published: Counter,

    /// Messages handed to the handler.
    pub deliveries_total: Counter,

    /// Malformed messages dropped.
    pub deliveries_rejected: Counter,

    /// Body bytes consumed.
    pub bytes_consumed: Counter,
}

impl RelayMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let connect_attempts = CounterVec::new(
            Opts::new(
                "check_relay_connect_attempts_total",
                "Total number of broker connect attempts by role",
            ),
            &["role"],
        )
        .expect("metric creation should succeed");

        let connect_failures = CounterVec::new(
            Opts::new(
                "check_relay_connect_failures_total",
                "Total number of failed broker connect attempts by role and step",
            ),
            &["role", "step"],
        )
        .expect("metric creation should succeed");

        let connected = IntGaugeVec::new(
            Opts::new(
                "check_relay_connected",
                "Whether the role currently holds a broker connection",
            ),
            &["role"],
        )
        .expect("metric creation should succeed");

        let published_total = Counter::new(
            "check_relay_published_total",
            "Total number of messages published",
        )
        .expect("metric creation should succeed");

        let publish_errors = Counter::new(
            "check_relay_publish_errors_total",
            "Total number of failed publish attempts",
        )
        .expect("metric creation should succeed");

        let publish_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "check_relay_publish_duration_seconds",
                "Time to write one message to the broker",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )
        .expect("metric creation should succeed");

        let bytes_published = Counter::new(
            "check_relay_bytes_published_total",
            "Total body bytes published",
        )
        .expect("metric creation should succeed");

        let deliveries_total = Counter::new(
            "check_relay_deliveries_total",
            "Total number of messages delivered to the handler",
        )
        .expect("metric creation should succeed");

        let deliveries_rejected = Counter::new(
            "check_relay_deliveries_rejected_total",
            "Total number of malformed messages dropped",
        )
        .expect("metric creation should succeed");

        let bytes_consumed = Counter::new(
            "check_relay_bytes_consumed_total",
            "Total body bytes consumed",
        )
        .expect("metric creation should succeed");

        registry
            .register(Box::new(connect_attempts.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(connect_failures.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(connected.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(published_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(publish_errors.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(publish_duration_seconds.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(bytes_published.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(deliveries_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(deliveries_rejected.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(bytes_consumed.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            connect_attempts,
            connect_failures,
            connected,
            published_total,
            publish_errors,
            publish_duration_seconds,
            bytes_published,
            deliveries_total,
            deliveries_rejected,
            bytes_consumed,
        }
    }

    /// Record a connect attempt for `role`.
    pub fn record_connect_attempt(&self, role: &str) {
        self.connect_attempts.with_label_values(&[role]).inc();
    }

    /// Record a failed connect attempt.
    pub fn record_connect_failure(&self, role: &str, step: &str) {
        self.connect_failures.with_label_values(&[role, step]).inc();
    }

    /// Set whether `role` is connected.
    pub fn set_connected(&self, role: &str, connected: bool) {
        self.connected
            .with_label_values(&[role])
            .set(i64::from(connected));
    }

    /// Record a successful publish.
    pub fn record_publish(&self, bytes: usize, duration_seconds: f64) {
        self.published_total.inc();
        self.bytes_published.inc_by(bytes as f64);
        self.publish_duration_seconds.observe(duration_seconds);
    }

    /// Record a failed publish.
    pub fn record_publish_error(&self) {
        self.publish_errors.inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
