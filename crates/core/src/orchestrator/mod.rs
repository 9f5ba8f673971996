//! The saga orchestrator: forward execution, compensation, cancellation,
//! and timeout handling for registered saga definitions.
//!
//! The orchestrator holds no saga state of its own. Every operation reads a
//! [`SagaRecord`] from the state store, acts on a transient copy, and
//! re-persists it with a conditional update before yielding control. Version
//! conflicts are retried internally against fresh state up to
//! [`CONFLICT_RETRY_LIMIT`] times; only an exhausted retry loop surfaces
//! [`SagaError::Conflict`] to the caller.
//!
//! Forward-step retries are durable: a failed attempt persists the bumped
//! attempt counter and schedules a [`TimeoutKind::StepRetry`] wake-up instead
//! of sleeping in-process, so a crashed coordinator resumes the retry after
//! restart. Compensation retries, by contrast, back off in-process; a
//! compensation that exhausts its retries parks the saga in `Compensating`
//! for an operator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::SagaError;
use crate::port::idempotency::IdempotencyStore;
use crate::port::state_store::{SagaStateStore, StateStoreError};
use crate::port::timeout_store::{SagaTimeout, TimeoutKind, TimeoutStore};
use crate::saga::{CompensationResult, SagaId, SagaRecord, SagaStatus};
use crate::workflow::{RetryDecision, RetryPolicy, SagaDefinition, SagaStep, StepError};

/// How many times a conditional write is retried against fresh state before
/// the conflict is surfaced.
pub const CONFLICT_RETRY_LIMIT: usize = 5;

/// Counters for coordinator activity. All loads and stores are relaxed;
/// the counters are monotonic and read only for reporting.
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    pub sagas_started: AtomicU64,
    pub sagas_completed: AtomicU64,
    pub sagas_compensated: AtomicU64,
    pub sagas_cancelled: AtomicU64,
    pub sagas_expired: AtomicU64,
    pub steps_executed: AtomicU64,
    pub step_failures: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub compensation_failures: AtomicU64,
    pub conflicts: AtomicU64,
}

impl OrchestratorMetrics {
    pub fn snapshot(&self) -> OrchestratorMetricsSnapshot {
        OrchestratorMetricsSnapshot {
            sagas_started: self.sagas_started.load(Ordering::Relaxed),
            sagas_completed: self.sagas_completed.load(Ordering::Relaxed),
            sagas_compensated: self.sagas_compensated.load(Ordering::Relaxed),
            sagas_cancelled: self.sagas_cancelled.load(Ordering::Relaxed),
            sagas_expired: self.sagas_expired.load(Ordering::Relaxed),
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            step_failures: self.step_failures.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            compensation_failures: self.compensation_failures.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`OrchestratorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorMetricsSnapshot {
    pub sagas_started: u64,
    pub sagas_completed: u64,
    pub sagas_compensated: u64,
    pub sagas_cancelled: u64,
    pub sagas_expired: u64,
    pub steps_executed: u64,
    pub step_failures: u64,
    pub retries_scheduled: u64,
    pub compensation_failures: u64,
    pub conflicts: u64,
}

/// Coordinates saga execution over pluggable state, timeout, and
/// idempotency stores.
pub struct SagaOrchestrator<D, S, T, I>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
    T: TimeoutStore,
    I: IdempotencyStore,
{
    config: CoordinatorConfig,
    state_store: Arc<S>,
    timeout_store: Arc<T>,
    idempotency: Arc<I>,
    definitions: RwLock<HashMap<String, Arc<SagaDefinition<D>>>>,
    /// Bounds concurrently running step and compensation closures.
    limiter: Arc<Semaphore>,
    metrics: OrchestratorMetrics,
}

impl<D, S, T, I> SagaOrchestrator<D, S, T, I>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
    T: TimeoutStore,
    I: IdempotencyStore,
{
    pub fn new(
        config: CoordinatorConfig,
        state_store: Arc<S>,
        timeout_store: Arc<T>,
        idempotency: Arc<I>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_parallelism.max(1)));
        Self {
            config,
            state_store,
            timeout_store,
            idempotency,
            definitions: RwLock::new(HashMap::new()),
            limiter,
            metrics: OrchestratorMetrics::default(),
        }
    }

    /// Register a definition under its name, replacing any previous one.
    pub fn register(&self, definition: SagaDefinition<D>) {
        info!(
            definition = %definition.name,
            steps = definition.step_count(),
            "saga definition registered"
        );
        self.definitions
            .write()
            .insert(definition.name.clone(), Arc::new(definition));
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> OrchestratorMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Start a new saga under a random id and run its first step.
    pub async fn start(&self, definition_name: &str, initial: D) -> Result<SagaId, SagaError> {
        let saga_id = SagaId::new();
        let dedup_key = format!("start:{}", saga_id);
        self.start_with_id(saga_id, definition_name, initial, &dedup_key)
            .await
    }

    /// Start a new saga under a caller-chosen id.
    ///
    /// `dedup_key` identifies the triggering delivery; it is consumed by the
    /// first step so a redelivered start message is ignored rather than
    /// re-advancing the saga.
    pub async fn start_with_id(
        &self,
        saga_id: SagaId,
        definition_name: &str,
        initial: D,
        dedup_key: &str,
    ) -> Result<SagaId, SagaError> {
        let definition = self.definition(definition_name)?;

        let mut record = SagaRecord::new(saga_id.clone(), definition_name, initial);
        record.log_activity(format!(
            "saga started with {} steps",
            definition.step_count()
        ));
        self.state_store
            .insert(record)
            .await
            .map_err(SagaError::from)?;
        self.count(&self.metrics.sagas_started);
        info!(saga_id = %saga_id, definition = definition_name, "saga started");

        if let Some(deadline) = definition.timeout.or(self.config.default_timeout) {
            let expiry = SagaTimeout::new(
                saga_id.clone(),
                definition_name,
                TimeoutKind::SagaExpiry,
                due_at_after(Utc::now(), deadline),
            );
            if let Err(err) = self.timeout_store.schedule(&expiry).await {
                warn!(saga_id = %saga_id, error = %err, "failed to schedule expiry timeout");
            }
        }

        self.execute_next_step(&saga_id, dedup_key).await?;
        Ok(saga_id)
    }

    /// Execute the step at the saga's current index and persist the outcome.
    ///
    /// No-ops (returning current state) when `dedup_key` was already
    /// processed, when the saga is terminal, or while compensation is in
    /// progress. Fails with [`SagaError::NotFound`] for unknown sagas.
    pub async fn execute_next_step(
        &self,
        saga_id: &SagaId,
        dedup_key: &str,
    ) -> Result<SagaRecord<D>, SagaError> {
        if dedup_key.trim().is_empty() {
            return Err(SagaError::invalid_argument("dedup key must not be blank"));
        }

        let mut last_conflict = (0u64, 0u64);
        for attempt in 0..CONFLICT_RETRY_LIMIT {
            let record = self
                .state_store
                .get(saga_id)
                .await
                .map_err(SagaError::from)?;

            if self
                .idempotency
                .is_processed(saga_id, dedup_key)
                .await
                .map_err(SagaError::from)?
            {
                debug!(saga_id = %saga_id, dedup_key, "duplicate delivery ignored");
                return Ok(record);
            }
            if record.is_terminal() {
                debug!(
                    saga_id = %saga_id,
                    status = %record.status,
                    "saga is terminal; message ignored"
                );
                return Ok(record);
            }
            if record.status == SagaStatus::Compensating {
                debug!(saga_id = %saga_id, "compensation in progress; forward message ignored");
                return Ok(record);
            }

            let definition = self.definition(&record.definition)?;
            match self.run_forward_step(record, &definition, dedup_key).await {
                Ok(updated) => return Ok(updated),
                Err(SagaError::Conflict { expected, actual }) => {
                    self.count(&self.metrics.conflicts);
                    last_conflict = (expected, actual);
                    debug!(saga_id = %saga_id, attempt, "write conflict; re-reading");
                }
                Err(err) => return Err(err),
            }
        }

        let (expected, actual) = last_conflict;
        Err(SagaError::Conflict { expected, actual })
    }

    /// Roll back a saga parked in `Compensating`.
    ///
    /// Walks the completed steps in reverse. The automatic path runs this
    /// directly after a permanent step failure; this entry point is for
    /// operators resuming a stalled compensation (or finishing one after
    /// auto-compensation was disabled).
    pub async fn compensate(&self, saga_id: &SagaId) -> Result<CompensationResult, SagaError> {
        let record = self
            .state_store
            .get(saga_id)
            .await
            .map_err(SagaError::from)?;
        if record.status != SagaStatus::Compensating {
            return Err(SagaError::InvalidState {
                saga_id: saga_id.clone(),
                status: record.status,
            });
        }
        let definition = self.definition(&record.definition)?;
        let (_, result) = self
            .run_compensation(record, &definition, SagaStatus::Compensated, None)
            .await?;
        Ok(result)
    }

    /// Cancel a running saga: transition to `Compensating`, roll back every
    /// completed step, and finish in `Cancelled`.
    ///
    /// Fails with [`SagaError::InvalidState`] unless the saga is `Running`.
    pub async fn cancel(&self, saga_id: &SagaId) -> Result<CompensationResult, SagaError> {
        for _ in 0..CONFLICT_RETRY_LIMIT {
            let mut record = self
                .state_store
                .get(saga_id)
                .await
                .map_err(SagaError::from)?;
            if record.status != SagaStatus::Running {
                return Err(SagaError::InvalidState {
                    saga_id: saga_id.clone(),
                    status: record.status,
                });
            }
            let definition = self.definition(&record.definition)?;

            record.log_activity("cancellation requested");
            record.transition(SagaStatus::Compensating);
            match self
                .state_store
                .update(record.clone(), record.version)
                .await
            {
                Ok(version) => {
                    record.version = version;
                    info!(saga_id = %saga_id, "saga cancelled; rolling back");
                    let (_, result) = self
                        .run_compensation(record, &definition, SagaStatus::Cancelled, None)
                        .await?;
                    return Ok(result);
                }
                Err(err) if err.is_conflict() => {
                    self.count(&self.metrics.conflicts);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(SagaError::transient("cancel kept losing write races"))
    }

    /// React to a delivered timeout according to its kind.
    ///
    /// Returns `Ok(())` when the timeout is consumed (including when it is
    /// obsolete); an error means delivery should leave the record in place
    /// and retry on a later cycle.
    pub async fn handle_timeout(&self, timeout: &SagaTimeout) -> Result<(), SagaError> {
        match &timeout.kind {
            TimeoutKind::StepRetry => {
                match self
                    .execute_next_step(&timeout.saga_id, &timeout.timeout_id)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(SagaError::NotFound { .. }) => {
                        debug!(
                            saga_id = %timeout.saga_id,
                            timeout_id = %timeout.timeout_id,
                            "retry timeout for unknown saga dropped"
                        );
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            TimeoutKind::SagaExpiry => self.expire_saga(timeout).await,
            TimeoutKind::Custom(kind) => {
                let kind = kind.clone();
                self.deliver_custom_timeout(timeout, &kind).await
            }
        }
    }

    /// Point lookup of a saga's persisted state.
    pub async fn get(&self, saga_id: &SagaId) -> Result<SagaRecord<D>, SagaError> {
        self.state_store
            .get(saga_id)
            .await
            .map_err(SagaError::from)
    }

    fn definition(&self, name: &str) -> Result<Arc<SagaDefinition<D>>, SagaError> {
        self.definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SagaError::DefinitionNotFound(name.to_string()))
    }

    fn default_policy(&self) -> RetryPolicy {
        RetryPolicy::ExponentialBackoff {
            max_retries: self.config.max_retry_attempts,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }

    fn count(&self, counter: &AtomicU64) {
        if self.config.enable_metrics {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Best-effort: marking happens only after the transition landed, so a
    /// failed mark costs at most one duplicate delivery.
    async fn mark_processed(&self, saga_id: &SagaId, key: &str) {
        if let Err(err) = self.idempotency.mark_processed(saga_id, key).await {
            warn!(saga_id = %saga_id, key, error = %err, "failed to mark delivery processed");
        }
    }

    async fn drop_pending_timeouts(&self, saga_id: &SagaId) {
        let pending = match self.timeout_store.for_saga(saga_id).await {
            Ok(pending) => pending,
            Err(err) => {
                debug!(saga_id = %saga_id, error = %err, "failed to list pending timeouts");
                return;
            }
        };
        for timeout in pending {
            if let Err(err) = self.timeout_store.remove(&timeout.timeout_id).await {
                debug!(
                    saga_id = %saga_id,
                    timeout_id = %timeout.timeout_id,
                    error = %err,
                    "failed to drop pending timeout"
                );
            }
        }
    }

    /// Run the pending step once and persist the result.
    ///
    /// Returns `Err(Conflict)` to the caller's retry loop when the
    /// conditional write loses; every other path persists exactly one
    /// transition.
    async fn run_forward_step(
        &self,
        mut record: SagaRecord<D>,
        definition: &SagaDefinition<D>,
        dedup_key: &str,
    ) -> Result<SagaRecord<D>, SagaError> {
        if let Some(step) = definition.step(record.current_step) {
            let step_index = record.current_step;
            let outcome = self.attempt(step, record.data.clone(), false).await;
            self.count(&self.metrics.steps_executed);

            match outcome {
                Ok(new_data) => {
                    record.data = new_data;
                    record.log_activity(format!("step {} '{}' completed", step_index, step.name));
                    record.advance_step();
                }
                Err(step_error) => {
                    return self
                        .handle_step_failure(record, definition, step, step_error, dedup_key)
                        .await;
                }
            }
        }

        let completed = record.current_step >= definition.step_count();
        if completed {
            record.log_activity("saga completed");
            record.transition(SagaStatus::Completed);
        }

        let version = self
            .state_store
            .update(record.clone(), record.version)
            .await
            .map_err(SagaError::from)?;
        record.version = version;
        self.mark_processed(&record.saga_id, dedup_key).await;

        if completed {
            self.count(&self.metrics.sagas_completed);
            info!(saga_id = %record.saga_id, "saga completed");
            self.drop_pending_timeouts(&record.saga_id).await;
            if let Some(hook) = definition.on_completed.as_ref() {
                hook(record.saga_id.clone(), record.data.clone()).await;
            }
        } else {
            debug!(
                saga_id = %record.saga_id,
                step = record.current_step,
                "step completed, saga advanced"
            );
        }

        Ok(record)
    }

    async fn handle_step_failure(
        &self,
        mut record: SagaRecord<D>,
        definition: &SagaDefinition<D>,
        step: &SagaStep<D>,
        step_error: StepError,
        dedup_key: &str,
    ) -> Result<SagaRecord<D>, SagaError> {
        self.count(&self.metrics.step_failures);
        let step_index = record.current_step;
        record.step_attempts += 1;
        let attempt = record.step_attempts;

        let policy = definition
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_policy());

        match policy.decide(attempt, &step_error) {
            RetryDecision::Retry { delay } => {
                record.log_activity(format!(
                    "step {} '{}' failed (attempt {}): {}; retrying in {:?}",
                    step_index, step.name, attempt, step_error, delay
                ));
                let version = self
                    .state_store
                    .update(record.clone(), record.version)
                    .await
                    .map_err(SagaError::from)?;
                record.version = version;
                self.mark_processed(&record.saga_id, dedup_key).await;

                let retry = SagaTimeout::new(
                    record.saga_id.clone(),
                    record.definition.clone(),
                    TimeoutKind::StepRetry,
                    due_at_after(Utc::now(), delay),
                );
                self.timeout_store
                    .schedule(&retry)
                    .await
                    .map_err(SagaError::from)?;
                self.count(&self.metrics.retries_scheduled);
                warn!(
                    saga_id = %record.saga_id,
                    step = %step.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %step_error,
                    "step failed; retry scheduled"
                );
                Ok(record)
            }
            RetryDecision::Stop => {
                record.log_activity(format!(
                    "step {} '{}' failed permanently after {} attempt(s): {}",
                    step_index, step.name, attempt, step_error
                ));
                record.transition(SagaStatus::Compensating);
                let version = self
                    .state_store
                    .update(record.clone(), record.version)
                    .await
                    .map_err(SagaError::from)?;
                record.version = version;
                self.mark_processed(&record.saga_id, dedup_key).await;
                error!(
                    saga_id = %record.saga_id,
                    step = %step.name,
                    error = %step_error,
                    "step failed permanently; compensation required"
                );

                if self.config.enable_auto_compensation {
                    let (record, _) = self
                        .run_compensation(
                            record,
                            definition,
                            SagaStatus::Compensated,
                            Some(step_error),
                        )
                        .await?;
                    Ok(record)
                } else {
                    // Parked for a manual `compensate`; the failure hook
                    // still fires so the owner learns about it now.
                    let result = CompensationResult::failure(
                        0,
                        "auto-compensation disabled; saga parked in compensating",
                        Duration::ZERO,
                    );
                    if let Some(hook) = definition.on_failed.as_ref() {
                        hook(record.saga_id.clone(), step_error, result).await;
                    }
                    Ok(record)
                }
            }
        }
    }

    /// Walk the completed steps in reverse, undoing each one, and finish in
    /// `final_status`. A compensator that exhausts its retries leaves the
    /// saga in `Compensating` and reports a failed [`CompensationResult`].
    async fn run_compensation(
        &self,
        mut record: SagaRecord<D>,
        definition: &SagaDefinition<D>,
        final_status: SagaStatus,
        trigger: Option<StepError>,
    ) -> Result<(SagaRecord<D>, CompensationResult), SagaError> {
        let started = Instant::now();
        let policy = definition
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_policy());
        let mut steps_compensated = 0usize;
        let mut stalled: Option<StepError> = None;

        while record.current_step > 0 {
            let step_index = record.current_step - 1;
            let Some(step) = definition.step(step_index) else {
                stalled = Some(StepError::failed(format!(
                    "definition '{}' has no step {}",
                    definition.name, step_index
                )));
                break;
            };

            match self.undo_with_retries(&record, step, &policy).await {
                Ok(new_data) => {
                    record.data = new_data;
                    record.current_step = step_index;
                    record.log_activity(format!("step {} '{}' compensated", step_index, step.name));
                    match self
                        .state_store
                        .update(record.clone(), record.version)
                        .await
                    {
                        Ok(version) => {
                            record.version = version;
                            steps_compensated += 1;
                        }
                        Err(err) if err.is_conflict() => {
                            self.count(&self.metrics.conflicts);
                            record = self
                                .state_store
                                .get(&record.saga_id)
                                .await
                                .map_err(SagaError::from)?;
                            if record.is_terminal() {
                                break;
                            }
                            // The undo ran but was not recorded; the fresh
                            // read decides which step to undo next.
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(error) => {
                    record.log_activity(format!(
                        "compensation for step {} '{}' failed: {}",
                        step_index, step.name, error
                    ));
                    match self
                        .state_store
                        .update(record.clone(), record.version)
                        .await
                    {
                        Ok(version) => record.version = version,
                        Err(err) => {
                            warn!(saga_id = %record.saga_id, error = ?err, "failed to persist compensation stall")
                        }
                    }
                    stalled = Some(error);
                    break;
                }
            }
        }

        let result = if let Some(error) = stalled {
            self.count(&self.metrics.compensation_failures);
            error!(
                saga_id = %record.saga_id,
                steps = steps_compensated,
                error = %error,
                "compensation stalled; saga parked in compensating"
            );
            CompensationResult::failure(steps_compensated, error.to_string(), started.elapsed())
        } else {
            if !record.is_terminal() {
                record.log_activity(match final_status {
                    SagaStatus::Cancelled => "saga cancelled; all completed steps rolled back",
                    _ => "all completed steps rolled back",
                });
                record.transition(final_status);
                match self
                    .state_store
                    .update(record.clone(), record.version)
                    .await
                {
                    Ok(version) => record.version = version,
                    Err(err) if err.is_conflict() => {
                        self.count(&self.metrics.conflicts);
                        record = self
                            .state_store
                            .get(&record.saga_id)
                            .await
                            .map_err(SagaError::from)?;
                        if !record.is_terminal() {
                            return Err(SagaError::Conflict {
                                expected: record.version,
                                actual: record.version,
                            });
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            match final_status {
                SagaStatus::Cancelled => self.count(&self.metrics.sagas_cancelled),
                _ => self.count(&self.metrics.sagas_compensated),
            }
            info!(
                saga_id = %record.saga_id,
                steps = steps_compensated,
                status = %record.status,
                "compensation complete"
            );
            self.drop_pending_timeouts(&record.saga_id).await;
            CompensationResult::success(steps_compensated, started.elapsed())
        };

        if let (Some(error), Some(hook)) = (trigger, definition.on_failed.as_ref()) {
            hook(record.saga_id.clone(), error, result.clone()).await;
        }

        Ok((record, result))
    }

    async fn undo_with_retries(
        &self,
        record: &SagaRecord<D>,
        step: &SagaStep<D>,
        policy: &RetryPolicy,
    ) -> Result<D, StepError> {
        let mut attempt: u32 = 1;
        loop {
            match self.attempt(step, record.data.clone(), true).await {
                Ok(data) => return Ok(data),
                Err(error) => match policy.decide(attempt, &error) {
                    RetryDecision::Retry { delay } => {
                        warn!(
                            saga_id = %record.saga_id,
                            step = %step.name,
                            attempt,
                            error = %error,
                            "compensation attempt failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::Stop => return Err(error),
                },
            }
        }
    }

    /// Run one step closure (forward or compensating) under the parallelism
    /// limiter and the step timeout.
    async fn attempt(&self, step: &SagaStep<D>, data: D, undo: bool) -> Result<D, StepError> {
        let permit = match self.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(StepError::cancelled("coordinator shut down")),
        };
        let step_timeout = step.timeout.unwrap_or(self.config.default_step_timeout);
        let action = if undo {
            step.undo(data)
        } else {
            step.run(data)
        };
        let outcome = match tokio::time::timeout(step_timeout, action).await {
            Ok(result) => result,
            Err(_) => Err(StepError::timeout(format!(
                "step '{}' exceeded {:?}",
                step.name, step_timeout
            ))),
        };
        drop(permit);
        outcome
    }

    async fn expire_saga(&self, timeout: &SagaTimeout) -> Result<(), SagaError> {
        if self
            .idempotency
            .is_processed(&timeout.saga_id, &timeout.timeout_id)
            .await
            .map_err(SagaError::from)?
        {
            return Ok(());
        }

        for _ in 0..CONFLICT_RETRY_LIMIT {
            let mut record = match self.state_store.get(&timeout.saga_id).await {
                Ok(record) => record,
                Err(err) if err.is_not_found() => {
                    debug!(saga_id = %timeout.saga_id, "expiry timeout for unknown saga dropped");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            // The deadline only kills idle running sagas; anything else has
            // already moved on.
            if record.status != SagaStatus::Running {
                debug!(
                    saga_id = %record.saga_id,
                    status = %record.status,
                    "expiry timeout obsolete"
                );
                self.mark_processed(&record.saga_id, &timeout.timeout_id).await;
                return Ok(());
            }

            record.log_activity("saga expired: deadline reached");
            record.transition(SagaStatus::Expired);
            match self
                .state_store
                .update(record.clone(), record.version)
                .await
            {
                Ok(_) => {
                    self.count(&self.metrics.sagas_expired);
                    warn!(saga_id = %record.saga_id, "saga expired at deadline");
                    self.mark_processed(&record.saga_id, &timeout.timeout_id).await;
                    self.drop_pending_timeouts(&record.saga_id).await;
                    return Ok(());
                }
                Err(err) if err.is_conflict() => {
                    self.count(&self.metrics.conflicts);
                }
                Err(StateStoreError::Terminal { .. }) => {
                    self.mark_processed(&record.saga_id, &timeout.timeout_id).await;
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(SagaError::transient("expiry transition kept losing write races"))
    }

    async fn deliver_custom_timeout(
        &self,
        timeout: &SagaTimeout,
        kind: &str,
    ) -> Result<(), SagaError> {
        if self
            .idempotency
            .is_processed(&timeout.saga_id, &timeout.timeout_id)
            .await
            .map_err(SagaError::from)?
        {
            return Ok(());
        }

        let record = match self.state_store.get(&timeout.saga_id).await {
            Ok(record) => record,
            Err(err) if err.is_not_found() => {
                debug!(saga_id = %timeout.saga_id, kind, "custom timeout for unknown saga dropped");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if record.is_terminal() {
            debug!(
                saga_id = %record.saga_id,
                status = %record.status,
                kind,
                "custom timeout ignored; saga is terminal"
            );
            return Ok(());
        }

        let definition = self.definition(&record.definition)?;
        let Some(hook) = definition.on_timeout.as_ref() else {
            warn!(
                saga_id = %record.saga_id,
                kind,
                "custom timeout dropped; definition has no timeout hook"
            );
            self.mark_processed(&record.saga_id, &timeout.timeout_id).await;
            return Ok(());
        };

        match hook(record.saga_id.clone(), record.data.clone(), timeout.clone()).await {
            Ok(new_data) => {
                let mut updated = record;
                updated.data = new_data;
                updated.log_activity(format!("timeout '{}' handled", kind));
                self.state_store
                    .update(updated.clone(), updated.version)
                    .await
                    .map_err(SagaError::from)?;
                self.mark_processed(&updated.saga_id, &timeout.timeout_id).await;
                Ok(())
            }
            Err(error) => {
                warn!(
                    saga_id = %record.saga_id,
                    kind,
                    error = %error,
                    "timeout hook failed; will redeliver"
                );
                Err(SagaError::transient(format!(
                    "timeout hook failed: {}",
                    error
                )))
            }
        }
    }
}

/// `now + delay`, saturating at the far end of the calendar instead of
/// overflowing.
fn due_at_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::idempotency::IdempotencyError;
    use crate::port::timeout_store::TimeoutStoreError;
    use crate::workflow::SagaDefinition;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct MockStateStore {
        records: Mutex<HashMap<SagaId, SagaRecord<i64>>>,
    }

    #[async_trait]
    impl SagaStateStore<i64> for MockStateStore {
        type Error = String;

        async fn insert(&self, record: SagaRecord<i64>) -> Result<(), StateStoreError<String>> {
            let mut records = self.records.lock();
            if records.contains_key(&record.saga_id) {
                return Err(StateStoreError::already_exists(record.saga_id));
            }
            records.insert(record.saga_id.clone(), record);
            Ok(())
        }

        async fn get(&self, saga_id: &SagaId) -> Result<SagaRecord<i64>, StateStoreError<String>> {
            self.records
                .lock()
                .get(saga_id)
                .cloned()
                .ok_or_else(|| StateStoreError::not_found(saga_id.clone()))
        }

        async fn update(
            &self,
            mut record: SagaRecord<i64>,
            expected_version: u64,
        ) -> Result<u64, StateStoreError<String>> {
            let mut records = self.records.lock();
            let current = records
                .get(&record.saga_id)
                .ok_or_else(|| StateStoreError::not_found(record.saga_id.clone()))?;
            if current.status.is_terminal() {
                return Err(StateStoreError::terminal(
                    record.saga_id.clone(),
                    current.status,
                ));
            }
            if current.version != expected_version {
                return Err(StateStoreError::conflict(expected_version, current.version));
            }
            let version = expected_version + 1;
            record.version = version;
            records.insert(record.saga_id.clone(), record);
            Ok(version)
        }

        async fn get_by_status(
            &self,
            status: SagaStatus,
            limit: usize,
        ) -> Result<Vec<SagaRecord<i64>>, StateStoreError<String>> {
            Ok(self
                .records
                .lock()
                .values()
                .filter(|r| r.status == status)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn delete(&self, saga_id: &SagaId) -> Result<(), StateStoreError<String>> {
            self.records
                .lock()
                .remove(saga_id)
                .map(|_| ())
                .ok_or_else(|| StateStoreError::not_found(saga_id.clone()))
        }
    }

    #[derive(Default)]
    struct MockTimeoutStore {
        timeouts: Mutex<HashMap<String, SagaTimeout>>,
    }

    impl MockTimeoutStore {
        fn count(&self) -> usize {
            self.timeouts.lock().len()
        }
    }

    #[async_trait]
    impl TimeoutStore for MockTimeoutStore {
        type Error = String;

        async fn schedule(&self, timeout: &SagaTimeout) -> Result<(), TimeoutStoreError<String>> {
            self.timeouts
                .lock()
                .insert(timeout.timeout_id.clone(), timeout.clone());
            Ok(())
        }

        async fn due(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<SagaTimeout>, TimeoutStoreError<String>> {
            let mut due: Vec<SagaTimeout> = self
                .timeouts
                .lock()
                .values()
                .filter(|t| t.is_due(now))
                .cloned()
                .collect();
            due.sort_by_key(|t| t.due_at);
            due.truncate(limit);
            Ok(due)
        }

        async fn remove(&self, timeout_id: &str) -> Result<(), TimeoutStoreError<String>> {
            self.timeouts
                .lock()
                .remove(timeout_id)
                .map(|_| ())
                .ok_or_else(|| TimeoutStoreError::not_found(timeout_id))
        }

        async fn for_saga(
            &self,
            saga_id: &SagaId,
        ) -> Result<Vec<SagaTimeout>, TimeoutStoreError<String>> {
            Ok(self
                .timeouts
                .lock()
                .values()
                .filter(|t| &t.saga_id == saga_id)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct MockIdempotencyStore {
        processed: Mutex<HashMap<SagaId, HashSet<String>>>,
    }

    #[async_trait]
    impl IdempotencyStore for MockIdempotencyStore {
        type Error = String;

        async fn is_processed(
            &self,
            saga_id: &SagaId,
            key: &str,
        ) -> Result<bool, IdempotencyError<String>> {
            Ok(self
                .processed
                .lock()
                .get(saga_id)
                .map(|keys| keys.contains(key))
                .unwrap_or(false))
        }

        async fn mark_processed(
            &self,
            saga_id: &SagaId,
            key: &str,
        ) -> Result<(), IdempotencyError<String>> {
            self.processed
                .lock()
                .entry(saga_id.clone())
                .or_default()
                .insert(key.to_string());
            Ok(())
        }

        async fn processed_count(&self, saga_id: &SagaId) -> Result<usize, IdempotencyError<String>> {
            Ok(self
                .processed
                .lock()
                .get(saga_id)
                .map(|keys| keys.len())
                .unwrap_or(0))
        }
    }

    type TestOrchestrator =
        SagaOrchestrator<i64, MockStateStore, MockTimeoutStore, MockIdempotencyStore>;

    fn orchestrator(config: CoordinatorConfig) -> (Arc<TestOrchestrator>, Arc<MockTimeoutStore>) {
        let timeouts = Arc::new(MockTimeoutStore::default());
        let orch = Arc::new(SagaOrchestrator::new(
            config,
            Arc::new(MockStateStore::default()),
            timeouts.clone(),
            Arc::new(MockIdempotencyStore::default()),
        ));
        (orch, timeouts)
    }

    /// Two steps: +1 then +10, each undone by the inverse.
    fn adder_definition() -> SagaDefinition<i64> {
        SagaDefinition::builder("adder")
            .step(SagaStep::new(
                "add-one",
                |n: i64| async move { Ok(n + 1) },
                |n: i64| async move { Ok(n - 1) },
            ))
            .step(SagaStep::new(
                "add-ten",
                |n: i64| async move { Ok(n + 10) },
                |n: i64| async move { Ok(n - 10) },
            ))
            .retry_policy(RetryPolicy::NoRetry)
            .build()
    }

    /// First step succeeds (+1), second always fails.
    fn failing_definition(policy: RetryPolicy) -> SagaDefinition<i64> {
        SagaDefinition::builder("doomed")
            .step(SagaStep::new(
                "add-one",
                |n: i64| async move { Ok(n + 1) },
                |n: i64| async move { Ok(n - 1) },
            ))
            .step(SagaStep::new(
                "explode",
                |_: i64| async move { Err(StepError::failed("charge rejected")) },
                |n: i64| async move { Ok(n) },
            ))
            .retry_policy(policy)
            .build()
    }

    #[tokio::test]
    async fn test_start_runs_first_step_and_schedules_expiry() {
        let (orch, timeouts) = orchestrator(CoordinatorConfig::default());
        orch.register(adder_definition());

        let saga_id = orch.start("adder", 0).await.unwrap();
        let record = orch.get(&saga_id).await.unwrap();

        assert_eq!(record.status, SagaStatus::Running);
        assert_eq!(record.current_step, 1);
        assert_eq!(record.data, 1);
        assert!(!record.activities.is_empty());

        let pending = timeouts.timeouts.lock();
        let expiry: Vec<_> = pending
            .values()
            .filter(|t| t.kind == TimeoutKind::SagaExpiry)
            .collect();
        assert_eq!(expiry.len(), 1);

        let metrics = orch.metrics();
        assert_eq!(metrics.sagas_started, 1);
        assert_eq!(metrics.steps_executed, 1);
    }

    #[tokio::test]
    async fn test_saga_completes_after_last_step() {
        let (orch, timeouts) = orchestrator(CoordinatorConfig::default());
        let completions = Arc::new(AtomicU32::new(0));
        let seen = completions.clone();
        let definition = SagaDefinition::builder("adder")
            .step(SagaStep::new(
                "add-one",
                |n: i64| async move { Ok(n + 1) },
                |n: i64| async move { Ok(n - 1) },
            ))
            .step(SagaStep::new(
                "add-ten",
                |n: i64| async move { Ok(n + 10) },
                |n: i64| async move { Ok(n - 10) },
            ))
            .on_completed(move |_, _| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build();
        orch.register(definition);

        let saga_id = orch.start("adder", 0).await.unwrap();
        let record = orch.execute_next_step(&saga_id, "msg-2").await.unwrap();

        assert_eq!(record.status, SagaStatus::Completed);
        assert_eq!(record.data, 11);
        assert!(record.completed_at.is_some());
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        // terminal sagas keep no pending wake-ups
        assert_eq!(timeouts.count(), 0);

        // redelivery of the same message is ignored
        let replay = orch.execute_next_step(&saga_id, "msg-2").await.unwrap();
        assert_eq!(replay.data, 11);
        assert_eq!(orch.metrics().sagas_completed, 1);
    }

    #[tokio::test]
    async fn test_failed_step_schedules_durable_retry() {
        let (orch, timeouts) = orchestrator(CoordinatorConfig::default());
        orch.register(failing_definition(RetryPolicy::FixedDelay {
            max_retries: 2,
            delay_ms: 10,
        }));

        let saga_id = orch.start("doomed", 0).await.unwrap();
        let record = orch.execute_next_step(&saga_id, "msg-2").await.unwrap();

        assert_eq!(record.status, SagaStatus::Running);
        assert_eq!(record.step_attempts, 1);
        assert_eq!(record.current_step, 1);

        let pending = timeouts.timeouts.lock();
        assert!(pending
            .values()
            .any(|t| t.kind == TimeoutKind::StepRetry && t.saga_id == saga_id));
        drop(pending);
        assert_eq!(orch.metrics().retries_scheduled, 1);
    }

    /// Same as [`failing_definition`] but with a failure hook counting
    /// invocations and asserting on the compensation outcome.
    fn failing_definition_with_hook(
        policy: RetryPolicy,
        expect_success: bool,
        expect_steps: usize,
        invocations: Arc<AtomicU32>,
    ) -> SagaDefinition<i64> {
        SagaDefinition::builder("doomed")
            .step(SagaStep::new(
                "add-one",
                |n: i64| async move { Ok(n + 1) },
                |n: i64| async move { Ok(n - 1) },
            ))
            .step(SagaStep::new(
                "explode",
                |_: i64| async move { Err(StepError::failed("charge rejected")) },
                |n: i64| async move { Ok(n) },
            ))
            .retry_policy(policy)
            .on_failed(move |_, error: StepError, result| {
                let invocations = invocations.clone();
                async move {
                    assert_eq!(error.message, "charge rejected");
                    assert_eq!(result.success, expect_success);
                    assert_eq!(result.steps_compensated, expect_steps);
                    invocations.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
    }

    #[tokio::test]
    async fn test_exhausted_retries_compensate_completed_steps() {
        let (orch, timeouts) = orchestrator(CoordinatorConfig::default());
        let failures = Arc::new(AtomicU32::new(0));
        orch.register(failing_definition_with_hook(
            RetryPolicy::NoRetry,
            true,
            1,
            failures.clone(),
        ));

        let saga_id = orch.start("doomed", 0).await.unwrap();
        let record = orch.execute_next_step(&saga_id, "msg-2").await.unwrap();

        assert_eq!(record.status, SagaStatus::Compensated);
        assert_eq!(record.data, 0, "completed step must be rolled back");
        assert_eq!(record.current_step, 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts.count(), 0);

        let metrics = orch.metrics();
        assert_eq!(metrics.sagas_compensated, 1);
        assert_eq!(metrics.step_failures, 1);
    }

    #[tokio::test]
    async fn test_disabled_auto_compensation_parks_the_saga() {
        let config = CoordinatorConfig::default().with_auto_compensation(false);
        let (orch, _) = orchestrator(config);
        let failures = Arc::new(AtomicU32::new(0));
        orch.register(failing_definition_with_hook(
            RetryPolicy::NoRetry,
            false,
            0,
            failures.clone(),
        ));

        let saga_id = orch.start("doomed", 0).await.unwrap();
        let record = orch.execute_next_step(&saga_id, "msg-2").await.unwrap();
        assert_eq!(record.status, SagaStatus::Compensating);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // operator finishes the rollback manually
        let result = orch.compensate(&saga_id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.steps_compensated, 1);
        assert_eq!(
            orch.get(&saga_id).await.unwrap().status,
            SagaStatus::Compensated
        );
    }

    #[tokio::test]
    async fn test_terminal_saga_ignores_messages() {
        let (orch, _) = orchestrator(CoordinatorConfig::default());
        orch.register(adder_definition());

        let saga_id = orch.start("adder", 0).await.unwrap();
        orch.execute_next_step(&saga_id, "msg-2").await.unwrap();

        let record = orch.execute_next_step(&saga_id, "late-message").await.unwrap();
        assert_eq!(record.status, SagaStatus::Completed);
        assert_eq!(record.data, 11);
    }

    #[tokio::test]
    async fn test_cancel_rolls_back_and_requires_running() {
        let (orch, _) = orchestrator(CoordinatorConfig::default());
        orch.register(adder_definition());

        // cancel mid-flight: one completed step gets undone
        let saga_id = orch.start("adder", 5).await.unwrap();
        let result = orch.cancel(&saga_id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.steps_compensated, 1);
        let record = orch.get(&saga_id).await.unwrap();
        assert_eq!(record.status, SagaStatus::Cancelled);
        assert_eq!(record.data, 5);

        // cancelling a terminal saga is an invalid state transition
        match orch.cancel(&saga_id).await {
            Err(SagaError::InvalidState { status, .. }) => {
                assert_eq!(status, SagaStatus::Cancelled)
            }
            other => panic!("expected invalid state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_definition_and_unknown_saga() {
        let (orch, _) = orchestrator(CoordinatorConfig::default());
        orch.register(adder_definition());

        match orch.start("nonexistent", 0).await {
            Err(SagaError::DefinitionNotFound(name)) => assert_eq!(name, "nonexistent"),
            other => panic!("expected definition not found, got {:?}", other),
        }

        let ghost = SagaId::from("ghost");
        match orch.execute_next_step(&ghost, "msg").await {
            Err(SagaError::NotFound { saga_id }) => assert_eq!(saga_id, ghost),
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blank_dedup_key_is_rejected() {
        let (orch, _) = orchestrator(CoordinatorConfig::default());
        orch.register(adder_definition());
        let saga_id = orch.start("adder", 0).await.unwrap();

        match orch.execute_next_step(&saga_id, "   ").await {
            Err(SagaError::InvalidArgument(_)) => {}
            other => panic!("expected invalid argument, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expiry_timeout_expires_running_saga() {
        let (orch, _) = orchestrator(CoordinatorConfig::default());
        orch.register(failing_definition(RetryPolicy::FixedDelay {
            max_retries: 5,
            delay_ms: 10,
        }));
        let saga_id = orch.start("doomed", 0).await.unwrap();

        let expiry = SagaTimeout::new(
            saga_id.clone(),
            "doomed",
            TimeoutKind::SagaExpiry,
            Utc::now(),
        );
        orch.handle_timeout(&expiry).await.unwrap();

        let record = orch.get(&saga_id).await.unwrap();
        assert_eq!(record.status, SagaStatus::Expired);
        assert_eq!(orch.metrics().sagas_expired, 1);

        // delivering the same expiry again is a no-op
        orch.handle_timeout(&expiry).await.unwrap();
        assert_eq!(orch.metrics().sagas_expired, 1);
    }

    #[tokio::test]
    async fn test_step_retry_timeout_reexecutes_step() {
        let (orch, timeouts) = orchestrator(CoordinatorConfig::default());
        orch.register(failing_definition(RetryPolicy::FixedDelay {
            max_retries: 1,
            delay_ms: 0,
        }));
        let saga_id = orch.start("doomed", 0).await.unwrap();
        orch.execute_next_step(&saga_id, "msg-2").await.unwrap();

        let retry = {
            let pending = timeouts.timeouts.lock();
            pending
                .values()
                .find(|t| t.kind == TimeoutKind::StepRetry)
                .cloned()
                .expect("retry scheduled")
        };

        // second failure exhausts the policy and compensation takes over
        orch.handle_timeout(&retry).await.unwrap();
        let record = orch.get(&saga_id).await.unwrap();
        assert_eq!(record.status, SagaStatus::Compensated);
        assert_eq!(record.data, 0);
    }

    #[tokio::test]
    async fn test_custom_timeout_runs_hook() {
        let (orch, _) = orchestrator(CoordinatorConfig::default());
        let definition = SagaDefinition::builder("waiting")
            .step(SagaStep::new(
                "add-one",
                |n: i64| async move { Ok(n + 1) },
                |n: i64| async move { Ok(n - 1) },
            ))
            .step(SagaStep::new(
                "add-ten",
                |n: i64| async move { Ok(n + 10) },
                |n: i64| async move { Ok(n - 10) },
            ))
            .on_timeout(|_, data: i64, _| async move { Ok(data + 100) })
            .build();
        orch.register(definition);

        let saga_id = orch.start("waiting", 0).await.unwrap();
        let reminder = SagaTimeout::new(
            saga_id.clone(),
            "waiting",
            TimeoutKind::Custom("payment-reminder".to_string()),
            Utc::now(),
        );
        orch.handle_timeout(&reminder).await.unwrap();

        let record = orch.get(&saga_id).await.unwrap();
        assert_eq!(record.data, 101);
        assert_eq!(record.status, SagaStatus::Running);
    }

    #[tokio::test]
    async fn test_zero_step_definition_completes_immediately() {
        let (orch, _) = orchestrator(CoordinatorConfig::default());
        orch.register(SagaDefinition::<i64>::builder("empty").build());

        let saga_id = orch.start("empty", 7).await.unwrap();
        let record = orch.get(&saga_id).await.unwrap();
        assert_eq!(record.status, SagaStatus::Completed);
        assert_eq!(record.data, 7);
    }
}
