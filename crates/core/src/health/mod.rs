//! Coordinator health reporting.
//!
//! The monitor scans active sagas and counts the ones that stopped making
//! progress. Zero stuck sagas is `Healthy`, any stuck saga degrades the
//! coordinator, and a count above the configured threshold makes it
//! `Unhealthy`. The classification itself is a pure function so the
//! boundaries are directly testable.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::HealthConfig;
use crate::error::SagaError;
use crate::port::state_store::SagaStateStore;
use crate::saga::SagaStatus;
use crate::service::cleanup::is_stale;

/// Page size for the health scan over active sagas.
const HEALTH_SCAN_LIMIT: usize = 10_000;

/// Tri-state health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Degraded still serves traffic; unhealthy should be taken out of
    /// rotation.
    pub fn is_operational(&self) -> bool {
        !matches!(self, Self::Unhealthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify a stuck-saga count against the unhealthy threshold.
pub fn classify(stuck_count: usize, unhealthy_threshold: usize) -> HealthStatus {
    if stuck_count > unhealthy_threshold {
        HealthStatus::Unhealthy
    } else if stuck_count > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// A single metric attached to a health report.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<usize> for MetricValue {
    fn from(value: usize) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// A health report from one component.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HealthInfo {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub metrics: HashMap<String, MetricValue>,
    pub checked_at: DateTime<Utc>,
}

impl HealthInfo {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            message: None,
            metrics: HashMap::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded).with_message(message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy).with_message(message)
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }
}

/// Anything that can report its own health.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health(&self) -> HealthInfo;

    async fn is_healthy(&self) -> bool {
        self.health().await.status.is_healthy()
    }
}

/// Summary produced by [`SagaHealthMonitor::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SagaHealth {
    pub status: HealthStatus,
    /// Active sagas (running or compensating) with no recent progress.
    pub stuck_count: usize,
    pub checked_at: DateTime<Utc>,
}

/// Scans active sagas and classifies the coordinator's health.
pub struct SagaHealthMonitor<D, S>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
{
    store: Arc<S>,
    config: HealthConfig,
    _data: PhantomData<fn() -> D>,
}

impl<D, S> SagaHealthMonitor<D, S>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
{
    pub fn new(store: Arc<S>, config: HealthConfig) -> Self {
        Self {
            store,
            config,
            _data: PhantomData,
        }
    }

    /// Count stuck active sagas and classify.
    ///
    /// Compensating sagas count too: a stalled rollback needs an operator
    /// just as much as a stalled forward step.
    pub async fn check(&self) -> Result<SagaHealth, SagaError> {
        self.check_at(Utc::now()).await
    }

    /// Like [`check`](Self::check) with an explicit clock.
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<SagaHealth, SagaError> {
        let mut stuck_count = 0usize;
        for status in [SagaStatus::Running, SagaStatus::Compensating] {
            let records = self
                .store
                .get_by_status(status, HEALTH_SCAN_LIMIT)
                .await
                .map_err(SagaError::from)?;
            stuck_count += records
                .iter()
                .filter(|r| is_stale(r.last_updated_at, now, self.config.stuck_threshold))
                .count();
        }

        let status = classify(stuck_count, self.config.unhealthy_stuck_threshold);
        if !status.is_healthy() {
            warn!(stuck = stuck_count, status = %status, "coordinator health degraded");
        }
        Ok(SagaHealth {
            status,
            stuck_count,
            checked_at: now,
        })
    }
}

#[async_trait]
impl<D, S> HealthCheck for SagaHealthMonitor<D, S>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
{
    async fn health(&self) -> HealthInfo {
        match self.check().await {
            Ok(health) => {
                let info = match health.status {
                    HealthStatus::Healthy => HealthInfo::healthy(),
                    HealthStatus::Degraded => HealthInfo::degraded(format!(
                        "{} stuck saga(s)",
                        health.stuck_count
                    )),
                    HealthStatus::Unhealthy => HealthInfo::unhealthy(format!(
                        "{} stuck saga(s) exceed the threshold",
                        health.stuck_count
                    )),
                };
                info.with_metric("stuck_sagas", health.stuck_count)
            }
            Err(err) => HealthInfo::unhealthy(format!("health scan failed: {}", err)),
        }
    }
}
