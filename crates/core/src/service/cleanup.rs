//! Cleanup sweep: force-expires stuck running sagas and purges old
//! terminal records.
//!
//! A saga that keeps receiving messages keeps refreshing `last_updated_at`;
//! one that stopped making progress goes stale. The sweep scans `Running`
//! records, expires the ones whose last update is older than the configured
//! threshold, and (when retention is configured) deletes terminal records
//! past their retention window. Expiry goes through the same conditional
//! update as every other writer, so a saga that resumes mid-sweep wins the
//! race and is skipped.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::CleanupConfig;
use crate::port::state_store::{SagaStateStore, StateStoreError};
use crate::saga::SagaStatus;

/// Statuses eligible for the retention purge.
const PURGEABLE: [SagaStatus; 4] = [
    SagaStatus::Completed,
    SagaStatus::Compensated,
    SagaStatus::Cancelled,
    SagaStatus::Expired,
];

/// `true` when `last_updated_at` is more than `threshold` before `now`.
///
/// Pure so the boundary is testable: a record exactly at the threshold is
/// not yet stale.
pub fn is_stale(last_updated_at: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    let threshold = match chrono::Duration::from_std(threshold) {
        Ok(threshold) => threshold,
        Err(_) => return false,
    };
    now.signed_duration_since(last_updated_at) > threshold
}

/// Outcome of one sweep cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Running records examined.
    pub scanned: usize,
    /// Stuck records transitioned to `Expired`.
    pub expired: usize,
    /// Terminal records deleted by the retention purge.
    pub purged: usize,
    /// Records that progressed mid-sweep and lost nothing.
    pub skipped: usize,
    /// Per-record failures left for the next cycle.
    pub errors: usize,
}

impl SweepResult {
    pub fn did_work(&self) -> bool {
        self.expired > 0 || self.purged > 0
    }
}

/// Counters for the cleanup loop.
#[derive(Debug, Default)]
pub struct CleanupMetrics {
    pub cycles: AtomicU64,
    pub sagas_expired: AtomicU64,
    pub sagas_purged: AtomicU64,
    pub scan_errors: AtomicU64,
}

impl CleanupMetrics {
    pub fn snapshot(&self) -> CleanupMetricsSnapshot {
        CleanupMetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            sagas_expired: self.sagas_expired.load(Ordering::Relaxed),
            sagas_purged: self.sagas_purged.load(Ordering::Relaxed),
            scan_errors: self.scan_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CleanupMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupMetricsSnapshot {
    pub cycles: u64,
    pub sagas_expired: u64,
    pub sagas_purged: u64,
    pub scan_errors: u64,
}

/// Periodic recovery sweep over the state store.
pub struct CleanupService<D, S>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
{
    store: Arc<S>,
    config: CleanupConfig,
    /// Retention window for terminal records; `None` disables the purge.
    retention: Option<Duration>,
    metrics: CleanupMetrics,
    _data: PhantomData<fn() -> D>,
}

impl<D, S> CleanupService<D, S>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
{
    pub fn new(store: Arc<S>, config: CleanupConfig, retention: Option<Duration>) -> Self {
        Self {
            store,
            config,
            retention,
            metrics: CleanupMetrics::default(),
            _data: PhantomData,
        }
    }

    pub fn metrics(&self) -> CleanupMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run the sweep loop until the shutdown channel fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            threshold_ms = self.config.timeout_threshold.as_millis() as u64,
            retention = ?self.retention,
            "cleanup sweep started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("cleanup sweep stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let result = self.sweep(Utc::now()).await;
                    if result.did_work() || self.config.verbose {
                        info!(
                            scanned = result.scanned,
                            expired = result.expired,
                            purged = result.purged,
                            skipped = result.skipped,
                            errors = result.errors,
                            "cleanup cycle finished"
                        );
                    }
                }
            }
        }
    }

    /// One sweep cycle against the given clock.
    ///
    /// A scan failure costs only this cycle; per-record failures cost only
    /// that record. Both are retried implicitly by the next cycle.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepResult {
        self.metrics.cycles.fetch_add(1, Ordering::Relaxed);
        let mut result = SweepResult::default();

        self.expire_stuck(now, &mut result).await;
        if self.retention.is_some() {
            self.purge_old_terminal(now, &mut result).await;
        }

        self.metrics
            .sagas_expired
            .fetch_add(result.expired as u64, Ordering::Relaxed);
        self.metrics
            .sagas_purged
            .fetch_add(result.purged as u64, Ordering::Relaxed);
        result
    }

    async fn expire_stuck(&self, now: DateTime<Utc>, result: &mut SweepResult) {
        let running = match self
            .store
            .get_by_status(SagaStatus::Running, self.config.batch_size)
            .await
        {
            Ok(running) => running,
            Err(err) => {
                self.metrics.scan_errors.fetch_add(1, Ordering::Relaxed);
                result.errors += 1;
                error!(error = ?err, "running-saga scan failed; next cycle retries");
                return;
            }
        };

        result.scanned = running.len();
        for mut record in running {
            if !is_stale(record.last_updated_at, now, self.config.timeout_threshold) {
                if self.config.verbose {
                    debug!(saga_id = %record.saga_id, "saga is fresh; skipping");
                }
                continue;
            }

            let stalled_for = now.signed_duration_since(record.last_updated_at);
            record.log_activity(format!(
                "expired by cleanup: no progress for {}s",
                stalled_for.num_seconds()
            ));
            record.transition(SagaStatus::Expired);
            let expected = record.version;
            match self.store.update(record.clone(), expected).await {
                Ok(_) => {
                    result.expired += 1;
                    warn!(
                        saga_id = %record.saga_id,
                        stalled_secs = stalled_for.num_seconds(),
                        "stuck saga expired"
                    );
                }
                Err(err) if err.is_conflict() => {
                    // progressed mid-sweep: no longer stuck
                    result.skipped += 1;
                    debug!(saga_id = %record.saga_id, "saga progressed mid-sweep; skipping");
                }
                Err(StateStoreError::Terminal { .. }) => {
                    result.skipped += 1;
                }
                Err(err) => {
                    result.errors += 1;
                    warn!(
                        saga_id = %record.saga_id,
                        error = ?err,
                        "failed to expire stuck saga; next cycle retries"
                    );
                }
            }
        }
    }

    async fn purge_old_terminal(&self, now: DateTime<Utc>, result: &mut SweepResult) {
        let Some(retention) = self.retention else {
            return;
        };

        for status in PURGEABLE {
            let records = match self.store.get_by_status(status, self.config.batch_size).await {
                Ok(records) => records,
                Err(err) => {
                    self.metrics.scan_errors.fetch_add(1, Ordering::Relaxed);
                    result.errors += 1;
                    warn!(status = %status, error = ?err, "terminal scan failed");
                    continue;
                }
            };

            for record in records {
                let Some(completed_at) = record.completed_at else {
                    continue;
                };
                if !is_stale(completed_at, now, retention) {
                    continue;
                }
                match self.store.delete(&record.saga_id).await {
                    Ok(()) => {
                        result.purged += 1;
                        debug!(
                            saga_id = %record.saga_id,
                            status = %status,
                            "terminal saga purged past retention"
                        );
                    }
                    Err(err) if err.is_not_found() => {}
                    Err(err) => {
                        result.errors += 1;
                        warn!(saga_id = %record.saga_id, error = ?err, "purge failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_boundary() {
        let now = Utc::now();
        let threshold = Duration::from_secs(3600);

        let two_hours_ago = now - chrono::Duration::hours(2);
        assert!(is_stale(two_hours_ago, now, threshold));

        let half_hour_ago = now - chrono::Duration::minutes(30);
        assert!(!is_stale(half_hour_ago, now, threshold));

        // exactly at the threshold is not yet stale
        let on_the_line = now - chrono::Duration::hours(1);
        assert!(!is_stale(on_the_line, now, threshold));

        // a 48h-stalled saga against a 24h threshold
        let two_days_ago = now - chrono::Duration::hours(48);
        assert!(is_stale(two_days_ago, now, Duration::from_secs(24 * 3600)));
    }

    #[test]
    fn test_future_updates_are_never_stale() {
        let now = Utc::now();
        let in_the_future = now + chrono::Duration::minutes(5);
        assert!(!is_stale(in_the_future, now, Duration::from_secs(60)));
    }

    #[test]
    fn test_sweep_result_did_work() {
        assert!(!SweepResult::default().did_work());
        assert!(SweepResult {
            expired: 1,
            ..Default::default()
        }
        .did_work());
        assert!(SweepResult {
            purged: 2,
            ..Default::default()
        }
        .did_work());
        assert!(!SweepResult {
            scanned: 10,
            skipped: 3,
            ..Default::default()
        }
        .did_work());
    }

    #[test]
    fn test_cleanup_metrics_snapshot() {
        let metrics = CleanupMetrics::default();
        metrics.cycles.fetch_add(4, Ordering::Relaxed);
        metrics.sagas_expired.fetch_add(2, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cycles, 4);
        assert_eq!(snapshot.sagas_expired, 2);
        assert_eq!(snapshot.sagas_purged, 0);
        assert_eq!(snapshot.scan_errors, 0);
    }
}
