//! In-memory timeout store.
//!
//! Pending timeouts keyed by timeout id. `due` returns records ordered by
//! `due_at` ascending, so earlier deadlines are delivered first within a
//! batch.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use sagakit_core::port::timeout_store::{SagaTimeout, TimeoutStore, TimeoutStoreError};
use sagakit_core::saga::SagaId;

/// Backend error for the in-memory timeout store; it has no failure modes.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryTimeoutError {}

/// In-memory [`TimeoutStore`] adapter.
#[derive(Default)]
pub struct InMemoryTimeoutStore {
    timeouts: RwLock<HashMap<String, SagaTimeout>>,
}

impl InMemoryTimeoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout_count(&self) -> usize {
        self.timeouts.read().len()
    }

    pub fn clear(&self) {
        self.timeouts.write().clear();
    }
}

#[async_trait]
impl TimeoutStore for InMemoryTimeoutStore {
    type Error = InMemoryTimeoutError;

    async fn schedule(
        &self,
        timeout: &SagaTimeout,
    ) -> Result<(), TimeoutStoreError<InMemoryTimeoutError>> {
        self.timeouts
            .write()
            .insert(timeout.timeout_id.clone(), timeout.clone());
        Ok(())
    }

    async fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaTimeout>, TimeoutStoreError<InMemoryTimeoutError>> {
        let mut due: Vec<SagaTimeout> = self
            .timeouts
            .read()
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.due_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn remove(&self, timeout_id: &str) -> Result<(), TimeoutStoreError<InMemoryTimeoutError>> {
        self.timeouts
            .write()
            .remove(timeout_id)
            .map(|_| ())
            .ok_or_else(|| TimeoutStoreError::not_found(timeout_id))
    }

    async fn for_saga(
        &self,
        saga_id: &SagaId,
    ) -> Result<Vec<SagaTimeout>, TimeoutStoreError<InMemoryTimeoutError>> {
        Ok(self
            .timeouts
            .read()
            .values()
            .filter(|t| &t.saga_id == saga_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagakit_core::port::timeout_store::TimeoutKind;

    fn timeout_due_in(id: &str, saga: &str, seconds: i64) -> SagaTimeout {
        let mut timeout = SagaTimeout::new(
            SagaId::from(saga),
            "test-definition",
            TimeoutKind::StepRetry,
            Utc::now() + chrono::Duration::seconds(seconds),
        );
        timeout.timeout_id = id.to_string();
        timeout
    }

    #[tokio::test]
    async fn test_due_returns_only_ripe_records_in_order() {
        let store = InMemoryTimeoutStore::new();
        store.schedule(&timeout_due_in("later", "s-1", -5)).await.unwrap();
        store.schedule(&timeout_due_in("first", "s-1", -60)).await.unwrap();
        store.schedule(&timeout_due_in("future", "s-1", 3600)).await.unwrap();

        let due = store.due(Utc::now(), 10).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|t| t.timeout_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "later"]);
    }

    #[tokio::test]
    async fn test_due_respects_batch_limit() {
        let store = InMemoryTimeoutStore::new();
        for i in 0..5 {
            store
                .schedule(&timeout_due_in(&format!("t-{}", i), "s-1", -(i as i64) - 1))
                .await
                .unwrap();
        }

        let due = store.due(Utc::now(), 2).await.unwrap();
        assert_eq!(due.len(), 2);
        // the two oldest deadlines come out first
        assert_eq!(due[0].timeout_id, "t-4");
        assert_eq!(due[1].timeout_id, "t-3");
    }

    #[tokio::test]
    async fn test_remove_consumes_record_once() {
        let store = InMemoryTimeoutStore::new();
        store.schedule(&timeout_due_in("t-1", "s-1", -1)).await.unwrap();

        store.remove("t-1").await.unwrap();
        assert_eq!(store.timeout_count(), 0);

        match store.remove("t-1").await {
            Err(TimeoutStoreError::NotFound { timeout_id }) => assert_eq!(timeout_id, "t-1"),
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_for_saga_filters_by_instance() {
        let store = InMemoryTimeoutStore::new();
        store.schedule(&timeout_due_in("a-1", "saga-a", 10)).await.unwrap();
        store.schedule(&timeout_due_in("a-2", "saga-a", 20)).await.unwrap();
        store.schedule(&timeout_due_in("b-1", "saga-b", 10)).await.unwrap();

        let for_a = store.for_saga(&SagaId::from("saga-a")).await.unwrap();
        assert_eq!(for_a.len(), 2);
        assert!(for_a.iter().all(|t| t.saga_id == SagaId::from("saga-a")));
    }
}
