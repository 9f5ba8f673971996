//! Timeout store port: durable scheduling of saga wake-ups.
//!
//! A [`SagaTimeout`] is immutable once created and consumed exactly once by
//! the delivery service, modulo at-least-once redelivery after a crash. The
//! orchestrator only creates records; it never mutates them in place.

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::saga::SagaId;

/// Discriminator describing what a timeout means to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Engine-scheduled redelivery of a failed step after a backoff delay.
    StepRetry,
    /// Engine-scheduled whole-saga deadline.
    SagaExpiry,
    /// Caller-defined wake-up, routed to the definition's timeout hook.
    Custom(String),
}

impl TimeoutKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::StepRetry => "step_retry",
            Self::SagaExpiry => "saga_expiry",
            Self::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scheduled wake-up for a saga instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaTimeout {
    /// Unique id; doubles as the idempotency key for delivery.
    pub timeout_id: String,
    pub saga_id: SagaId,
    /// Definition name of the target saga.
    pub saga_type: String,
    pub kind: TimeoutKind,
    /// Opaque bytes interpreted by the timeout hook.
    pub payload: Option<Vec<u8>>,
    pub due_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
}

impl SagaTimeout {
    pub fn new(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        kind: TimeoutKind,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            timeout_id: uuid::Uuid::new_v4().to_string(),
            saga_id,
            saga_type: saga_type.into(),
            kind,
            payload: None,
            due_at,
            scheduled_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Whether the timeout is ready for delivery at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }
}

/// Errors from timeout store operations, wrapped per operation.
#[derive(Debug, thiserror::Error)]
pub enum TimeoutStoreError<E> {
    #[error("failed to schedule timeout: {0:?}")]
    Schedule(E),

    #[error("failed to query due timeouts: {0:?}")]
    Retrieve(E),

    #[error("failed to remove timeout: {0:?}")]
    Remove(E),

    #[error("timeout not found: {timeout_id}")]
    NotFound { timeout_id: String },
}

impl<E> TimeoutStoreError<E> {
    pub fn not_found(timeout_id: impl Into<String>) -> Self {
        Self::NotFound {
            timeout_id: timeout_id.into(),
        }
    }
}

/// Durable store of pending [`SagaTimeout`] records.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Backend-specific error type.
    type Error: Debug + Send + Sync + 'static;

    /// Persist a new timeout record.
    async fn schedule(&self, timeout: &SagaTimeout) -> Result<(), TimeoutStoreError<Self::Error>>;

    /// Fetch up to `limit` records with `due_at <= now`, ordered by `due_at`
    /// ascending (best-effort FIFO).
    async fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaTimeout>, TimeoutStoreError<Self::Error>>;

    /// Remove a record once delivered. Removing an unknown id fails with
    /// [`TimeoutStoreError::NotFound`]; delivery treats that as already
    /// consumed.
    async fn remove(&self, timeout_id: &str) -> Result<(), TimeoutStoreError<Self::Error>>;

    /// All pending timeouts for one saga. Used to drop wake-ups once the
    /// saga reaches a terminal state.
    async fn for_saga(
        &self,
        saga_id: &SagaId,
    ) -> Result<Vec<SagaTimeout>, TimeoutStoreError<Self::Error>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_timeout_has_unique_id_and_schedule_time() {
        let due = Utc::now() + Duration::minutes(5);
        let a = SagaTimeout::new(SagaId::from("s-1"), "order", TimeoutKind::StepRetry, due);
        let b = SagaTimeout::new(SagaId::from("s-1"), "order", TimeoutKind::StepRetry, due);

        assert_ne!(a.timeout_id, b.timeout_id);
        assert!(a.scheduled_at <= Utc::now());
        assert!(a.payload.is_none());
    }

    #[test]
    fn test_is_due_compares_against_now() {
        let now = Utc::now();
        let overdue = SagaTimeout::new(
            SagaId::from("s-1"),
            "order",
            TimeoutKind::SagaExpiry,
            now - Duration::seconds(1),
        );
        let pending = SagaTimeout::new(
            SagaId::from("s-1"),
            "order",
            TimeoutKind::SagaExpiry,
            now + Duration::hours(1),
        );

        assert!(overdue.is_due(now));
        assert!(!pending.is_due(now));
    }

    #[test]
    fn test_kind_string_forms() {
        assert_eq!(TimeoutKind::StepRetry.as_str(), "step_retry");
        assert_eq!(TimeoutKind::SagaExpiry.as_str(), "saga_expiry");
        assert_eq!(
            TimeoutKind::Custom("payment_deadline".to_string()).as_str(),
            "payment_deadline"
        );
    }

    #[test]
    fn test_payload_builder() {
        let timeout = SagaTimeout::new(
            SagaId::from("s-2"),
            "order",
            TimeoutKind::Custom("remind".to_string()),
            Utc::now(),
        )
        .with_payload(vec![1, 2, 3]);

        assert_eq!(timeout.payload.as_deref(), Some(&[1u8, 2, 3][..]));
    }
}
