//! Coordinator configuration.
//!
//! One configuration object covers the orchestrator and both background
//! services. Every field has a production default; `with_*` builders adjust
//! individual knobs and [`EnvConfig`] overlays environment variables for
//! containerized deployments.

use std::time::Duration;

/// Top-level coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Whole-saga deadline. When set, an expiry timeout is scheduled at
    /// start for definitions that do not carry their own timeout. `None`
    /// disables the deadline.
    pub default_timeout: Option<Duration>,
    /// Per-step execution timeout used when a step has none of its own.
    pub default_step_timeout: Duration,
    /// Retry budget used when a definition has no retry policy of its own.
    pub max_retry_attempts: u32,
    /// Bound on concurrently executing step/compensation bodies across all
    /// saga instances.
    pub max_parallelism: usize,
    /// Run compensation immediately when a step exhausts its retries. When
    /// off, the saga is parked in `Compensating` for a manual `compensate`.
    pub enable_auto_compensation: bool,
    /// Advisory to embedding builders: wire a durable store when true, an
    /// in-memory one when false. The orchestrator always goes through its
    /// store port either way.
    pub enable_state_persistence: bool,
    /// Record counters. Disabling turns metric recording into a no-op.
    pub enable_metrics: bool,
    /// How long terminal records are kept before the cleanup purge removes
    /// them. `None` keeps them forever.
    pub completed_saga_retention: Option<Duration>,
    pub delivery: DeliveryConfig,
    pub cleanup: CleanupConfig,
    pub health: HealthConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(24 * 60 * 60)),
            default_step_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            max_parallelism: 10,
            enable_auto_compensation: true,
            enable_state_persistence: true,
            enable_metrics: true,
            completed_saga_retention: None,
            delivery: DeliveryConfig::default(),
            cleanup: CleanupConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_max_parallelism(mut self, limit: usize) -> Self {
        self.max_parallelism = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_auto_compensation(mut self, enabled: bool) -> Self {
        self.enable_auto_compensation = enabled;
        self
    }

    #[must_use]
    pub fn with_state_persistence(mut self, enabled: bool) -> Self {
        self.enable_state_persistence = enabled;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.completed_saga_retention = retention;
        self
    }

    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    #[must_use]
    pub fn with_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    #[must_use]
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }
}

/// Timeout delivery service knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Pause between polling cycles.
    pub poll_interval: Duration,
    /// Maximum due timeouts fetched per cycle.
    pub batch_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Cleanup sweep knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    /// Pause between sweep cycles.
    pub interval: Duration,
    /// A `Running` saga whose last update is older than this is considered
    /// stuck and force-expired.
    pub timeout_threshold: Duration,
    /// Page size for the status scan.
    pub batch_size: usize,
    /// Extra diagnostic detail; never changes control flow.
    pub verbose: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout_threshold: Duration::from_secs(60 * 60),
            batch_size: 100,
            verbose: false,
        }
    }
}

impl CleanupConfig {
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_timeout_threshold(mut self, threshold: Duration) -> Self {
        self.timeout_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Health monitor knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Active sagas older than this (by last update) count as stuck.
    pub stuck_threshold: Duration,
    /// Stuck count above which the coordinator reports `Unhealthy`.
    pub unhealthy_stuck_threshold: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: Duration::from_secs(5 * 60),
            unhealthy_stuck_threshold: 10,
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_unhealthy_stuck_threshold(mut self, count: usize) -> Self {
        self.unhealthy_stuck_threshold = count;
        self
    }
}

/// Environment-variable overlay for [`CoordinatorConfig`].
///
/// Unset or unparseable variables fall back to the defaults.
pub struct EnvConfig;

impl EnvConfig {
    pub fn load_coordinator_config() -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();

        if let Some(ms) = Self::parse_var::<u64>("SAGA_DEFAULT_TIMEOUT_MS") {
            config.default_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = Self::parse_var::<u64>("SAGA_STEP_TIMEOUT_MS") {
            config.default_step_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = Self::parse_var::<u32>("SAGA_MAX_RETRY_ATTEMPTS") {
            config.max_retry_attempts = attempts;
        }
        if let Some(limit) = Self::parse_var::<usize>("SAGA_MAX_PARALLELISM") {
            config.max_parallelism = limit.max(1);
        }
        if let Some(enabled) = Self::parse_var::<bool>("SAGA_AUTO_COMPENSATION") {
            config.enable_auto_compensation = enabled;
        }
        if let Some(enabled) = Self::parse_var::<bool>("SAGA_STATE_PERSISTENCE") {
            config.enable_state_persistence = enabled;
        }
        if let Some(enabled) = Self::parse_var::<bool>("SAGA_ENABLE_METRICS") {
            config.enable_metrics = enabled;
        }
        if let Some(ms) = Self::parse_var::<u64>("SAGA_RETENTION_MS") {
            config.completed_saga_retention = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(ms) = Self::parse_var::<u64>("SAGA_DELIVERY_POLL_MS") {
            config.delivery.poll_interval = Duration::from_millis(ms);
        }
        if let Some(batch) = Self::parse_var::<usize>("SAGA_DELIVERY_BATCH") {
            config.delivery.batch_size = batch.max(1);
        }

        if let Some(ms) = Self::parse_var::<u64>("SAGA_CLEANUP_INTERVAL_MS") {
            config.cleanup.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = Self::parse_var::<u64>("SAGA_CLEANUP_THRESHOLD_MS") {
            config.cleanup.timeout_threshold = Duration::from_millis(ms);
        }
        if let Some(batch) = Self::parse_var::<usize>("SAGA_CLEANUP_BATCH") {
            config.cleanup.batch_size = batch.max(1);
        }
        if let Some(verbose) = Self::parse_var::<bool>("SAGA_CLEANUP_VERBOSE") {
            config.cleanup.verbose = verbose;
        }

        if let Some(ms) = Self::parse_var::<u64>("SAGA_HEALTH_STUCK_MS") {
            config.health.stuck_threshold = Duration::from_millis(ms);
        }
        if let Some(count) = Self::parse_var::<usize>("SAGA_HEALTH_UNHEALTHY_COUNT") {
            config.health.unhealthy_stuck_threshold = count;
        }

        config
    }

    fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
        std::env::var(name).ok().and_then(|v| v.parse().ok())
    }
}
