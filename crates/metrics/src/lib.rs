//! Prometheus metrics for the sagakit coordinator.
//!
//! [`PrometheusMetrics`] owns a registry and the coordinator's instrument
//! set. Transports call [`gather`](PrometheusMetrics::gather) from their
//! `/metrics` handler; the orchestrator and the background services report
//! through the [`CoordinatorMetrics`] event API and the `observe_*` batch
//! helpers.

use std::sync::Arc;

use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};

use sagakit_core::health::{HealthStatus, SagaHealth};
use sagakit_core::service::{DeliveryResult, SweepResult};

/// Event-level metrics reported by the coordinator.
pub trait CoordinatorMetrics: Send + Sync + 'static {
    /// A saga started.
    fn saga_started(&self, definition: &str);

    /// A saga ran all its steps.
    fn saga_completed(&self, definition: &str, duration_ms: u64);

    /// A saga failed and its completed steps were rolled back.
    fn saga_compensated(&self, definition: &str, duration_ms: u64);

    /// A saga was cancelled by its owner.
    fn saga_cancelled(&self, definition: &str);

    /// A saga hit its deadline.
    fn saga_expired(&self, definition: &str);

    /// A forward step finished successfully.
    fn step_executed(&self, definition: &str, step: &str, duration_ms: u64);

    /// A forward step failed.
    fn step_failed(&self, definition: &str, step: &str, error_kind: &str);

    /// A durable retry was scheduled for a failed step.
    fn retry_scheduled(&self, definition: &str, step: &str);

    /// One compensating action completed.
    fn compensation_step(&self, definition: &str);

    /// A compensating action exhausted its retries.
    fn compensation_failed(&self, definition: &str);

    /// A conditional write lost its race.
    fn conflict_detected(&self);
}

/// Prometheus-backed implementation of [`CoordinatorMetrics`].
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: prometheus::Registry,

    // Saga lifecycle
    saga_started: prometheus::IntCounterVec,
    saga_finished: prometheus::IntCounterVec,
    saga_duration: prometheus::HistogramVec,
    saga_active: prometheus::IntGaugeVec,

    // Steps
    step_executed: prometheus::IntCounterVec,
    step_failed: prometheus::IntCounterVec,
    step_duration: prometheus::HistogramVec,
    retry_scheduled: prometheus::IntCounterVec,

    // Compensation
    compensation_steps: prometheus::IntCounterVec,
    compensation_failed: prometheus::IntCounterVec,

    // Store contention
    write_conflicts: prometheus::IntCounter,

    // Timeout delivery loop
    delivery_delivered: prometheus::IntCounter,
    delivery_failed: prometheus::IntCounter,
    delivery_duration: prometheus::Histogram,

    // Cleanup loop
    cleanup_expired: prometheus::IntCounter,
    cleanup_purged: prometheus::IntCounter,
    cleanup_errors: prometheus::IntCounter,

    // Health
    stuck_sagas: prometheus::IntGauge,
    health_status: prometheus::IntGauge,
}

impl PrometheusMetrics {
    /// Create new Prometheus metrics with default buckets.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_buckets(
            vec![0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0],
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0],
        )
    }

    /// Create new Prometheus metrics with custom duration buckets.
    pub fn with_buckets(
        saga_buckets: Vec<f64>,
        step_buckets: Vec<f64>,
    ) -> Result<Self, prometheus::Error> {
        let registry = prometheus::Registry::new();

        let saga_started = prometheus::IntCounterVec::new(
            prometheus::opts!("saga_started_total", "Total sagas started"),
            &["definition"],
        )?;
        registry.register(Box::new(saga_started.clone()))?;

        let saga_finished = prometheus::IntCounterVec::new(
            prometheus::opts!(
                "saga_finished_total",
                "Total sagas that reached a terminal status"
            ),
            &["definition", "outcome"],
        )?;
        registry.register(Box::new(saga_finished.clone()))?;

        let saga_duration = prometheus::HistogramVec::new(
            prometheus::histogram_opts!(
                "saga_duration_seconds",
                "Saga duration from start to terminal status in seconds",
                saga_buckets
            ),
            &["definition", "outcome"],
        )?;
        registry.register(Box::new(saga_duration.clone()))?;

        let saga_active = prometheus::IntGaugeVec::new(
            prometheus::opts!("saga_active", "Sagas currently running or compensating"),
            &["definition"],
        )?;
        registry.register(Box::new(saga_active.clone()))?;

        let step_executed = prometheus::IntCounterVec::new(
            prometheus::opts!(
                "saga_step_executed_total",
                "Total forward steps completed successfully"
            ),
            &["definition", "step"],
        )?;
        registry.register(Box::new(step_executed.clone()))?;

        let step_failed = prometheus::IntCounterVec::new(
            prometheus::opts!("saga_step_failed_total", "Total forward step failures"),
            &["definition", "step", "error_kind"],
        )?;
        registry.register(Box::new(step_failed.clone()))?;

        let step_duration = prometheus::HistogramVec::new(
            prometheus::histogram_opts!(
                "saga_step_duration_seconds",
                "Forward step execution duration in seconds",
                step_buckets
            ),
            &["definition", "step"],
        )?;
        registry.register(Box::new(step_duration.clone()))?;

        let retry_scheduled = prometheus::IntCounterVec::new(
            prometheus::opts!(
                "saga_retry_scheduled_total",
                "Total durable step retries scheduled"
            ),
            &["definition", "step"],
        )?;
        registry.register(Box::new(retry_scheduled.clone()))?;

        let compensation_steps = prometheus::IntCounterVec::new(
            prometheus::opts!(
                "saga_compensation_steps_total",
                "Total compensating actions completed"
            ),
            &["definition"],
        )?;
        registry.register(Box::new(compensation_steps.clone()))?;

        let compensation_failed = prometheus::IntCounterVec::new(
            prometheus::opts!(
                "saga_compensation_failed_total",
                "Total compensating actions that exhausted their retries"
            ),
            &["definition"],
        )?;
        registry.register(Box::new(compensation_failed.clone()))?;

        let write_conflicts = prometheus::IntCounter::new(
            "saga_write_conflicts_total",
            "Total conditional writes that lost their race",
        )?;
        registry.register(Box::new(write_conflicts.clone()))?;

        let delivery_delivered = prometheus::IntCounter::new(
            "saga_timeouts_delivered_total",
            "Total timeouts consumed and removed by delivery",
        )?;
        registry.register(Box::new(delivery_delivered.clone()))?;

        let delivery_failed = prometheus::IntCounter::new(
            "saga_timeouts_failed_total",
            "Total timeout deliveries left for a later cycle",
        )?;
        registry.register(Box::new(delivery_failed.clone()))?;

        let delivery_duration = prometheus::Histogram::with_opts(prometheus::histogram_opts!(
            "saga_delivery_cycle_duration_seconds",
            "Timeout delivery cycle duration in seconds",
            vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
        ))?;
        registry.register(Box::new(delivery_duration.clone()))?;

        let cleanup_expired = prometheus::IntCounter::new(
            "saga_cleanup_expired_total",
            "Total stuck sagas force-expired by the cleanup sweep",
        )?;
        registry.register(Box::new(cleanup_expired.clone()))?;

        let cleanup_purged = prometheus::IntCounter::new(
            "saga_cleanup_purged_total",
            "Total terminal sagas purged past retention",
        )?;
        registry.register(Box::new(cleanup_purged.clone()))?;

        let cleanup_errors = prometheus::IntCounter::new(
            "saga_cleanup_errors_total",
            "Total per-record cleanup failures",
        )?;
        registry.register(Box::new(cleanup_errors.clone()))?;

        let stuck_sagas = prometheus::IntGauge::new(
            "saga_stuck_sagas",
            "Active sagas with no recent progress",
        )?;
        registry.register(Box::new(stuck_sagas.clone()))?;

        let health_status = prometheus::IntGauge::new(
            "saga_coordinator_health_status",
            "Coordinator health: 0 healthy, 1 degraded, 2 unhealthy",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        Ok(Self {
            registry,
            saga_started,
            saga_finished,
            saga_duration,
            saga_active,
            step_executed,
            step_failed,
            step_duration,
            retry_scheduled,
            compensation_steps,
            compensation_failed,
            write_conflicts,
            delivery_delivered,
            delivery_failed,
            delivery_duration,
            cleanup_expired,
            cleanup_purged,
            cleanup_errors,
            stuck_sagas,
            health_status,
        })
    }

    /// Get the registry for custom metric registration.
    pub fn registry(&self) -> &prometheus::Registry {
        &self.registry
    }

    /// Content type for the `/metrics` HTTP response.
    pub fn content_type(&self) -> &'static str {
        "text/plain; version=0.0.4; charset=utf-8"
    }

    /// Gather all metrics in the Prometheus text format.
    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        buffer
    }

    /// Record the outcome of one timeout delivery cycle.
    pub fn observe_delivery_cycle(&self, result: &DeliveryResult) {
        self.delivery_delivered.inc_by(result.delivered as u64);
        self.delivery_failed.inc_by(result.failed as u64);
        self.delivery_duration.observe(result.duration.as_secs_f64());
    }

    /// Record the outcome of one cleanup sweep.
    pub fn observe_sweep(&self, result: &SweepResult) {
        self.cleanup_expired.inc_by(result.expired as u64);
        self.cleanup_purged.inc_by(result.purged as u64);
        self.cleanup_errors.inc_by(result.errors as u64);
    }

    /// Record the latest health check.
    pub fn observe_health(&self, health: &SagaHealth) {
        self.stuck_sagas.set(health.stuck_count as i64);
        self.health_status.set(match health.status {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        });
    }

    fn finish(&self, definition: &str, outcome: &str, duration_ms: Option<u64>) {
        self.saga_finished
            .with_label_values(&[definition, outcome])
            .inc();
        if let Some(duration_ms) = duration_ms {
            self.saga_duration
                .with_label_values(&[definition, outcome])
                .observe(duration_ms as f64 / 1000.0);
        }
        self.saga_active.with_label_values(&[definition]).dec();
    }
}

impl CoordinatorMetrics for PrometheusMetrics {
    fn saga_started(&self, definition: &str) {
        self.saga_started.with_label_values(&[definition]).inc();
        self.saga_active.with_label_values(&[definition]).inc();
    }

    fn saga_completed(&self, definition: &str, duration_ms: u64) {
        self.finish(definition, "completed", Some(duration_ms));
    }

    fn saga_compensated(&self, definition: &str, duration_ms: u64) {
        self.finish(definition, "compensated", Some(duration_ms));
    }

    fn saga_cancelled(&self, definition: &str) {
        self.finish(definition, "cancelled", None);
    }

    fn saga_expired(&self, definition: &str) {
        self.finish(definition, "expired", None);
    }

    fn step_executed(&self, definition: &str, step: &str, duration_ms: u64) {
        self.step_executed
            .with_label_values(&[definition, step])
            .inc();
        self.step_duration
            .with_label_values(&[definition, step])
            .observe(duration_ms as f64 / 1000.0);
    }

    fn step_failed(&self, definition: &str, step: &str, error_kind: &str) {
        self.step_failed
            .with_label_values(&[definition, step, error_kind])
            .inc();
    }

    fn retry_scheduled(&self, definition: &str, step: &str) {
        self.retry_scheduled
            .with_label_values(&[definition, step])
            .inc();
    }

    fn compensation_step(&self, definition: &str) {
        self.compensation_steps
            .with_label_values(&[definition])
            .inc();
    }

    fn compensation_failed(&self, definition: &str) {
        self.compensation_failed
            .with_label_values(&[definition])
            .inc();
    }

    fn conflict_detected(&self) {
        self.write_conflicts.inc();
    }
}

/// No-op metrics for tests and metrics-disabled deployments.
#[derive(Debug, Default, Clone)]
pub struct NoopCoordinatorMetrics;

impl CoordinatorMetrics for NoopCoordinatorMetrics {
    fn saga_started(&self, _definition: &str) {}
    fn saga_completed(&self, _definition: &str, _duration_ms: u64) {}
    fn saga_compensated(&self, _definition: &str, _duration_ms: u64) {}
    fn saga_cancelled(&self, _definition: &str) {}
    fn saga_expired(&self, _definition: &str) {}
    fn step_executed(&self, _definition: &str, _step: &str, _duration_ms: u64) {}
    fn step_failed(&self, _definition: &str, _step: &str, _error_kind: &str) {}
    fn retry_scheduled(&self, _definition: &str, _step: &str) {}
    fn compensation_step(&self, _definition: &str) {}
    fn compensation_failed(&self, _definition: &str) {}
    fn conflict_detected(&self) {}
}

/// Wrapper for optional metrics that gracefully handles `None`.
#[derive(Clone, Default)]
pub struct OptionalMetrics(pub Option<Arc<dyn CoordinatorMetrics>>);

impl OptionalMetrics {
    pub fn new(metrics: Option<Arc<dyn CoordinatorMetrics>>) -> Self {
        Self(metrics)
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    pub fn saga_started(&self, definition: &str) {
        if let Some(metrics) = &self.0 {
            metrics.saga_started(definition);
        }
    }

    pub fn saga_completed(&self, definition: &str, duration_ms: u64) {
        if let Some(metrics) = &self.0 {
            metrics.saga_completed(definition, duration_ms);
        }
    }

    pub fn saga_compensated(&self, definition: &str, duration_ms: u64) {
        if let Some(metrics) = &self.0 {
            metrics.saga_compensated(definition, duration_ms);
        }
    }

    pub fn saga_cancelled(&self, definition: &str) {
        if let Some(metrics) = &self.0 {
            metrics.saga_cancelled(definition);
        }
    }

    pub fn saga_expired(&self, definition: &str) {
        if let Some(metrics) = &self.0 {
            metrics.saga_expired(definition);
        }
    }

    pub fn step_executed(&self, definition: &str, step: &str, duration_ms: u64) {
        if let Some(metrics) = &self.0 {
            metrics.step_executed(definition, step, duration_ms);
        }
    }

    pub fn step_failed(&self, definition: &str, step: &str, error_kind: &str) {
        if let Some(metrics) = &self.0 {
            metrics.step_failed(definition, step, error_kind);
        }
    }

    pub fn retry_scheduled(&self, definition: &str, step: &str) {
        if let Some(metrics) = &self.0 {
            metrics.retry_scheduled(definition, step);
        }
    }

    pub fn compensation_step(&self, definition: &str) {
        if let Some(metrics) = &self.0 {
            metrics.compensation_step(definition);
        }
    }

    pub fn compensation_failed(&self, definition: &str) {
        if let Some(metrics) = &self.0 {
            metrics.compensation_failed(definition);
        }
    }

    pub fn conflict_detected(&self) {
        if let Some(metrics) = &self.0 {
            metrics.conflict_detected();
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled.
    pub enabled: bool,
    /// HTTP endpoint path for metrics.
    pub path: String,
    /// Histogram buckets for saga duration.
    pub saga_duration_buckets: Vec<f64>,
    /// Histogram buckets for step duration.
    pub step_duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
            saga_duration_buckets: vec![0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0],
            step_duration_buckets: vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0],
        }
    }
}
