//! State store port: durable persistence of saga records.
//!
//! The store owns the durable representation of [`SagaRecord`] and exposes
//! point lookups, conditional updates, and a status-scoped scan used by the
//! recovery sweeps.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::saga::{SagaId, SagaRecord, SagaStatus};

/// Errors from state store operations.
///
/// Generic over the backend error type `E`, which converts into
/// [`StateStoreError::Backend`] via `?`.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError<E> {
    /// Conditional update lost the race: the stored version no longer matches
    /// what the writer last read.
    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("saga not found: {saga_id}")]
    NotFound { saga_id: SagaId },

    #[error("saga already exists: {saga_id}")]
    AlreadyExists { saga_id: SagaId },

    /// The stored record is in a terminal state and therefore immutable.
    #[error("saga {saga_id} is {status}, record is immutable")]
    Terminal { saga_id: SagaId, status: SagaStatus },

    #[error("backend error: {0:?}")]
    Backend(E),
}

impl<E> StateStoreError<E> {
    pub fn conflict(expected: u64, actual: u64) -> Self {
        Self::Conflict { expected, actual }
    }

    pub fn not_found(saga_id: SagaId) -> Self {
        Self::NotFound { saga_id }
    }

    pub fn already_exists(saga_id: SagaId) -> Self {
        Self::AlreadyExists { saga_id }
    }

    pub fn terminal(saga_id: SagaId, status: SagaStatus) -> Self {
        Self::Terminal { saga_id, status }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl<E> From<E> for StateStoreError<E> {
    fn from(err: E) -> Self {
        Self::Backend(err)
    }
}

/// Durable store of one [`SagaRecord`] per saga instance.
///
/// ## Optimistic locking protocol
///
/// A writer reads a record, mutates its copy, and presents the `version` it
/// read back to [`update`](SagaStateStore::update). The store applies the
/// write only when the stored version still matches, incrementing it by one;
/// otherwise the call fails with [`StateStoreError::Conflict`] and the writer
/// re-reads and retries its whole step against fresh state. This enforces the
/// single-writer-per-instance invariant without long-lived locks.
///
/// Updates against a record that already reached a terminal state fail with
/// [`StateStoreError::Terminal`]; terminal records can only be read or
/// deleted (retention purge).
#[async_trait]
pub trait SagaStateStore<D>: Send + Sync
where
    D: Clone + Send + Sync + 'static,
{
    /// Backend-specific error type.
    type Error: Debug + Send + Sync + 'static;

    /// Persist a brand-new record. Fails with `AlreadyExists` when the id is
    /// taken.
    async fn insert(&self, record: SagaRecord<D>) -> Result<(), StateStoreError<Self::Error>>;

    /// Point lookup by saga id.
    async fn get(&self, saga_id: &SagaId) -> Result<SagaRecord<D>, StateStoreError<Self::Error>>;

    /// Conditional update; returns the new stored version on success.
    async fn update(
        &self,
        record: SagaRecord<D>,
        expected_version: u64,
    ) -> Result<u64, StateStoreError<Self::Error>>;

    /// Scan of at most `limit` records in the given status. Ordering is
    /// unspecified; callers page by repeating the scan after acting on the
    /// returned records.
    async fn get_by_status(
        &self,
        status: SagaStatus,
        limit: usize,
    ) -> Result<Vec<SagaRecord<D>>, StateStoreError<Self::Error>>;

    /// Remove a record entirely. Used by the retention purge.
    async fn delete(&self, saga_id: &SagaId) -> Result<(), StateStoreError<Self::Error>>;
}
