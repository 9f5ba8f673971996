//! Saga definitions: ordered steps with compensating actions, retry policy,
//! and lifecycle hooks.
//!
//! A [`SagaDefinition`] is configuration, not persisted state. Steps are
//! tagged descriptors held by value: a forward closure, a compensating
//! closure, and an optional per-step timeout. Both closures take the business
//! payload by value and return the updated payload on success, so a failed
//! attempt never leaks a partial mutation into the persisted record.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::port::timeout_store::SagaTimeout;
use crate::saga::{CompensationResult, SagaId};

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The business action failed.
    Failed,
    /// The action ran past its step timeout.
    Timeout,
    /// The action was cancelled; never retried.
    Cancelled,
}

/// Error raised by a step's forward or compensating action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Failed,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Cancelled,
            message: message.into(),
        }
    }

    /// Cancellation is final; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, StepErrorKind::Cancelled)
    }
}

/// Boxed step action: payload in, updated payload (or failure) out.
pub type StepFn<D> = Arc<dyn Fn(D) -> BoxFuture<'static, Result<D, StepError>> + Send + Sync>;

/// Hook invoked after a saga completes all steps.
pub type CompletionHook<D> = Arc<dyn Fn(SagaId, D) -> BoxFuture<'static, ()> + Send + Sync>;

/// Hook invoked exactly once when a step failure triggers compensation,
/// carrying the triggering error and the compensation outcome.
pub type FailureHook =
    Arc<dyn Fn(SagaId, StepError, CompensationResult) -> BoxFuture<'static, ()> + Send + Sync>;

/// Hook invoked for caller-defined timeout kinds delivered to a saga.
pub type TimeoutHook<D> =
    Arc<dyn Fn(SagaId, D, SagaTimeout) -> BoxFuture<'static, Result<D, StepError>> + Send + Sync>;

/// One step of a saga: a forward action and its compensating action.
#[derive(Clone)]
pub struct SagaStep<D> {
    pub name: String,
    /// Overrides the coordinator's default step timeout when set.
    pub timeout: Option<Duration>,
    execute: StepFn<D>,
    compensate: StepFn<D>,
}

impl<D> SagaStep<D> {
    pub fn new<F, FFut, C, CFut>(name: impl Into<String>, execute: F, compensate: C) -> Self
    where
        F: Fn(D) -> FFut + Send + Sync + 'static,
        FFut: Future<Output = Result<D, StepError>> + Send + 'static,
        C: Fn(D) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<D, StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout: None,
            execute: Arc::new(move |data| Box::pin(execute(data))),
            compensate: Arc::new(move |data| Box::pin(compensate(data))),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run the forward action.
    pub fn run(&self, data: D) -> BoxFuture<'static, Result<D, StepError>> {
        (self.execute)(data)
    }

    /// Run the compensating action.
    pub fn undo(&self, data: D) -> BoxFuture<'static, Result<D, StepError>> {
        (self.compensate)(data)
    }
}

impl<D> std::fmt::Debug for SagaStep<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// An ordered multi-step transaction template, addressable by name.
///
/// Built through [`SagaDefinition::builder`]. The retry policy and whole-saga
/// timeout fall back to the coordinator configuration when unset.
#[derive(Clone)]
pub struct SagaDefinition<D> {
    pub name: String,
    pub steps: Vec<SagaStep<D>>,
    /// Whole-saga deadline. An expiry timeout is scheduled at start when set
    /// here or in the coordinator config.
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub(crate) on_completed: Option<CompletionHook<D>>,
    pub(crate) on_failed: Option<FailureHook>,
    pub(crate) on_timeout: Option<TimeoutHook<D>>,
}

impl<D> SagaDefinition<D> {
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder<D> {
        SagaDefinitionBuilder::new(name)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, index: usize) -> Option<&SagaStep<D>> {
        self.steps.get(index)
    }
}

impl<D> std::fmt::Debug for SagaDefinition<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder<D> {
    name: String,
    steps: Vec<SagaStep<D>>,
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
    on_completed: Option<CompletionHook<D>>,
    on_failed: Option<FailureHook>,
    on_timeout: Option<TimeoutHook<D>>,
}

impl<D> SagaDefinitionBuilder<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            timeout: None,
            retry_policy: None,
            on_completed: None,
            on_failed: None,
            on_timeout: None,
        }
    }

    #[must_use]
    pub fn step(mut self, step: SagaStep<D>) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn on_completed<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(SagaId, D) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_completed = Some(Arc::new(move |id, data| Box::pin(hook(id, data))));
        self
    }

    #[must_use]
    pub fn on_failed<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(SagaId, StepError, CompensationResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_failed = Some(Arc::new(move |id, error, result| {
            Box::pin(hook(id, error, result))
        }));
        self
    }

    #[must_use]
    pub fn on_timeout<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(SagaId, D, SagaTimeout) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D, StepError>> + Send + 'static,
    {
        self.on_timeout = Some(Arc::new(move |id, data, timeout| {
            Box::pin(hook(id, data, timeout))
        }));
        self
    }

    pub fn build(self) -> SagaDefinition<D> {
        SagaDefinition {
            name: self.name,
            steps: self.steps,
            timeout: self.timeout,
            retry_policy: self.retry_policy,
            on_completed: self.on_completed,
            on_failed: self.on_failed,
            on_timeout: self.on_timeout,
        }
    }
}

/// Pure retry decision for step and compensation attempts.
///
/// The policy is stateless: attempt counters live in the caller's persisted
/// state. With `max_retries = N`, failures on attempts `1..=N` are retried
/// and the failure on attempt `N + 1` stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Fail immediately on the first error.
    NoRetry,
    /// Exponential backoff with a delay cap.
    ExponentialBackoff {
        max_retries: u32,
        base_delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    },
    /// Constant delay between attempts.
    FixedDelay { max_retries: u32, delay_ms: u64 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            max_retries: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Stop,
}

impl RetryPolicy {
    /// Decide whether the `attempt`-th failure (1-based) should be retried.
    pub fn decide(&self, attempt: u32, error: &StepError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Stop;
        }
        match self {
            Self::NoRetry => RetryDecision::Stop,
            Self::ExponentialBackoff {
                max_retries,
                base_delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                if attempt > *max_retries {
                    return RetryDecision::Stop;
                }
                let exponent = attempt.saturating_sub(1).min(63);
                let delay_ms = (*base_delay_ms as f64) * multiplier.powi(exponent as i32);
                let delay_ms = (delay_ms as u64).min(*max_delay_ms);
                RetryDecision::Retry {
                    delay: Duration::from_millis(delay_ms),
                }
            }
            Self::FixedDelay {
                max_retries,
                delay_ms,
            } => {
                if attempt > *max_retries {
                    RetryDecision::Stop
                } else {
                    RetryDecision::Retry {
                        delay: Duration::from_millis(*delay_ms),
                    }
                }
            }
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::NoRetry => 0,
            Self::ExponentialBackoff { max_retries, .. } => *max_retries,
            Self::FixedDelay { max_retries, .. } => *max_retries,
        }
    }
}
