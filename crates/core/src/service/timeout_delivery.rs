//! Timeout delivery: polls the timeout store for due records and injects
//! them into the orchestrator.
//!
//! Delivery is at-least-once. A record is removed only after the
//! orchestrator consumed it, so a crash between injection and removal means
//! redelivery on a later cycle; the idempotency guard keyed by the timeout
//! id keeps the redelivery from double-acting. One failing record never
//! stops the rest of its batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::DeliveryConfig;
use crate::orchestrator::SagaOrchestrator;
use crate::port::idempotency::IdempotencyStore;
use crate::port::state_store::SagaStateStore;
use crate::port::timeout_store::{TimeoutStore, TimeoutStoreError};

/// Outcome of one delivery cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryResult {
    /// Due records fetched this cycle.
    pub fetched: usize,
    /// Records consumed and removed.
    pub delivered: usize,
    /// Records left in place for a later cycle.
    pub failed: usize,
    pub duration: Duration,
}

impl DeliveryResult {
    fn empty(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Counters for the delivery loop.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    pub cycles: AtomicU64,
    pub fetched: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub fetch_errors: AtomicU64,
}

impl DeliveryMetrics {
    pub fn snapshot(&self) -> DeliveryMetricsSnapshot {
        DeliveryMetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DeliveryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryMetricsSnapshot {
    pub cycles: u64,
    pub fetched: u64,
    pub delivered: u64,
    pub failed: u64,
    pub fetch_errors: u64,
}

/// Polls due timeouts and hands them to the orchestrator.
pub struct TimeoutDeliveryService<D, S, T, I>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
    T: TimeoutStore,
    I: IdempotencyStore,
{
    orchestrator: Arc<SagaOrchestrator<D, S, T, I>>,
    timeout_store: Arc<T>,
    config: DeliveryConfig,
    metrics: DeliveryMetrics,
}

impl<D, S, T, I> TimeoutDeliveryService<D, S, T, I>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
    T: TimeoutStore,
    I: IdempotencyStore,
{
    pub fn new(
        orchestrator: Arc<SagaOrchestrator<D, S, T, I>>,
        timeout_store: Arc<T>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            orchestrator,
            timeout_store,
            config,
            metrics: DeliveryMetrics::default(),
        }
    }

    pub fn metrics(&self) -> DeliveryMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run the polling loop until the shutdown channel fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "timeout delivery started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("timeout delivery stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let result = self.process_batch(Utc::now()).await;
                    if result.failed > 0 {
                        warn!(
                            fetched = result.fetched,
                            delivered = result.delivered,
                            failed = result.failed,
                            "delivery cycle finished with failures"
                        );
                    } else if result.fetched > 0 {
                        debug!(
                            delivered = result.delivered,
                            duration_ms = result.duration.as_millis() as u64,
                            "delivery cycle finished"
                        );
                    }
                }
            }
        }
    }

    /// One delivery cycle against the given clock.
    ///
    /// Fetches at most `batch_size` due records, injects each into the
    /// orchestrator, and removes the consumed ones. Per-record errors are
    /// logged and counted; the record stays for the next cycle.
    pub async fn process_batch(&self, now: DateTime<Utc>) -> DeliveryResult {
        let started = Instant::now();
        self.metrics.cycles.fetch_add(1, Ordering::Relaxed);

        let due = match self.timeout_store.due(now, self.config.batch_size).await {
            Ok(due) => due,
            Err(err) => {
                self.metrics.fetch_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "failed to fetch due timeouts");
                return DeliveryResult::empty(started.elapsed());
            }
        };

        let mut delivered = 0usize;
        let mut failed = 0usize;
        for timeout in &due {
            match self.orchestrator.handle_timeout(timeout).await {
                Ok(()) => match self.timeout_store.remove(&timeout.timeout_id).await {
                    Ok(()) | Err(TimeoutStoreError::NotFound { .. }) => {
                        delivered += 1;
                    }
                    Err(err) => {
                        // consumed but not removed: the guard absorbs the
                        // redelivery, so count it failed and move on
                        failed += 1;
                        warn!(
                            timeout_id = %timeout.timeout_id,
                            saga_id = %timeout.saga_id,
                            error = %err,
                            "timeout consumed but not removed; will redeliver"
                        );
                    }
                },
                Err(err) => {
                    failed += 1;
                    error!(
                        timeout_id = %timeout.timeout_id,
                        saga_id = %timeout.saga_id,
                        error = %err,
                        "timeout delivery failed; will retry next cycle"
                    );
                }
            }
        }

        self.metrics
            .fetched
            .fetch_add(due.len() as u64, Ordering::Relaxed);
        self.metrics
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.metrics
            .failed
            .fetch_add(failed as u64, Ordering::Relaxed);

        DeliveryResult {
            fetched: due.len(),
            delivered,
            failed,
            duration: started.elapsed(),
        }
    }
}
