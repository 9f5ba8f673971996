//! Idempotency guard port.
//!
//! Tracks which (saga instance, dedup key) pairs have already been processed
//! so that at-least-once delivery of steps and timeouts never re-executes
//! effects. Keys are scoped per saga id; the same key under a different saga
//! is independent.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::saga::SagaId;

/// Errors from idempotency guard operations.
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError<E> {
    /// Blank saga id or key.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The guard's backend has shut down; the operation did not run.
    #[error("operation cancelled")]
    Cancelled,

    #[error("backend error: {0:?}")]
    Backend(E),
}

impl<E> IdempotencyError<E> {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

impl<E> From<E> for IdempotencyError<E> {
    fn from(err: E) -> Self {
        Self::Backend(err)
    }
}

/// Validate guard inputs. Both operations of [`IdempotencyStore`] must reject
/// blank ids and keys with `InvalidArgument` instead of recording garbage.
pub fn ensure_valid_key<E>(saga_id: &SagaId, key: &str) -> Result<(), IdempotencyError<E>> {
    if saga_id.as_str().trim().is_empty() {
        return Err(IdempotencyError::invalid_argument("saga id must not be blank"));
    }
    if key.trim().is_empty() {
        return Err(IdempotencyError::invalid_argument("dedup key must not be blank"));
    }
    Ok(())
}

/// Store of processed (saga id, dedup key) pairs.
///
/// Concurrent marks for the same key must converge to "processed" without
/// error or duplication; marking twice has the same effect as once. A shut
/// down backend fails with [`IdempotencyError::Cancelled`] rather than
/// silently succeeding.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Backend-specific error type.
    type Error: Debug + Send + Sync + 'static;

    /// Whether the pair was already marked.
    async fn is_processed(
        &self,
        saga_id: &SagaId,
        key: &str,
    ) -> Result<bool, IdempotencyError<Self::Error>>;

    /// Record the pair as processed. Idempotent.
    async fn mark_processed(
        &self,
        saga_id: &SagaId,
        key: &str,
    ) -> Result<(), IdempotencyError<Self::Error>>;

    /// Number of distinct keys marked for the saga.
    async fn processed_count(
        &self,
        saga_id: &SagaId,
    ) -> Result<usize, IdempotencyError<Self::Error>>;
}
