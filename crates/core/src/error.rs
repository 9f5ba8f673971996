//! Coordinator error taxonomy.
//!
//! Background loops treat [`SagaError::Transient`] as retriable and never let
//! it escape; the orchestrator converts step and compensation failures into
//! state transitions plus activity entries, so callers observe failure
//! through saga state rather than through escaped errors.

use std::fmt::Debug;

use crate::port::idempotency::IdempotencyError;
use crate::port::state_store::StateStoreError;
use crate::port::timeout_store::TimeoutStoreError;
use crate::saga::{SagaId, SagaStatus};

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("saga not found: {saga_id}")]
    NotFound { saga_id: SagaId },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Optimistic-concurrency collision. Retried internally by the
    /// orchestrator; surfaced only when the internal retry bound is spent.
    #[error("version conflict persisted after retries: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// Store or transport failure. Retried by the calling background loop,
    /// never fatal to the process.
    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    /// A business step failed and compensation was triggered.
    #[error("step {step} failed: {message}")]
    StepFailed { step: usize, message: String },

    /// A compensating action exhausted its retries. The saga stays in
    /// `Compensating` and needs operator attention.
    #[error("compensation for step {step} failed: {message}")]
    CompensationFailed { step: usize, message: String },

    #[error("no definition registered under '{0}'")]
    DefinitionNotFound(String),

    /// Operation not legal in the saga's current state, e.g. cancelling a
    /// saga that is not running.
    #[error("saga {saga_id} is {status}; operation not valid")]
    InvalidState { saga_id: SagaId, status: SagaStatus },

    #[error("operation cancelled")]
    Cancelled,
}

impl SagaError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl<E: Debug> From<StateStoreError<E>> for SagaError {
    fn from(err: StateStoreError<E>) -> Self {
        match err {
            StateStoreError::Conflict { expected, actual } => Self::Conflict { expected, actual },
            StateStoreError::NotFound { saga_id } => Self::NotFound { saga_id },
            StateStoreError::AlreadyExists { saga_id } => {
                Self::InvalidArgument(format!("saga already exists: {}", saga_id))
            }
            StateStoreError::Terminal { saga_id, status } => {
                Self::InvalidState { saga_id, status }
            }
            StateStoreError::Backend(e) => Self::Transient(format!("state store: {:?}", e)),
        }
    }
}

impl<E: Debug> From<TimeoutStoreError<E>> for SagaError {
    fn from(err: TimeoutStoreError<E>) -> Self {
        Self::Transient(format!("timeout store: {}", err))
    }
}

impl<E: Debug> From<IdempotencyError<E>> for SagaError {
    fn from(err: IdempotencyError<E>) -> Self {
        match err {
            IdempotencyError::InvalidArgument(message) => Self::InvalidArgument(message),
            IdempotencyError::Cancelled => Self::Cancelled,
            IdempotencyError::Backend(e) => Self::Transient(format!("idempotency store: {:?}", e)),
        }
    }
}
