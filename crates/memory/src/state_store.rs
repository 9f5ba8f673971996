//! In-memory saga state store.
//!
//! A `RwLock<HashMap>` keyed by saga id, suitable for tests and
//! single-process deployments. The conditional-update protocol is the same
//! one a SQL adapter would enforce with `WHERE version = ?`: mismatched
//! versions fail with `Conflict`, writes against terminal records fail with
//! `Terminal`, and a successful write stores `expected_version + 1`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use sagakit_core::port::state_store::{SagaStateStore, StateStoreError};
use sagakit_core::saga::{SagaId, SagaRecord, SagaStatus};

/// Backend error for the in-memory store. Real operations never fail; the
/// only variant is the injected one used to exercise error paths in tests.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryStateError {
    #[error("injected failure: {0}")]
    Injected(String),
}

/// In-memory [`SagaStateStore`] adapter.
pub struct InMemorySagaStore<D> {
    records: RwLock<HashMap<SagaId, SagaRecord<D>>>,
    fail_next_scan: AtomicBool,
}

impl<D> InMemorySagaStore<D> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            fail_next_scan: AtomicBool::new(false),
        }
    }

    /// Make the next `get_by_status` call fail with an injected backend
    /// error. One-shot; the call after it succeeds again.
    pub fn fail_next_scan(&self) {
        self.fail_next_scan.store(true, Ordering::SeqCst);
    }

    pub fn saga_count(&self) -> usize {
        self.records.read().len()
    }

    pub fn count_by_status(&self, status: SagaStatus) -> usize {
        self.records
            .read()
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl<D> Default for InMemorySagaStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D> SagaStateStore<D> for InMemorySagaStore<D>
where
    D: Clone + Send + Sync + 'static,
{
    type Error = InMemoryStateError;

    async fn insert(
        &self,
        record: SagaRecord<D>,
    ) -> Result<(), StateStoreError<InMemoryStateError>> {
        let mut records = self.records.write();
        if records.contains_key(&record.saga_id) {
            return Err(StateStoreError::already_exists(record.saga_id));
        }
        records.insert(record.saga_id.clone(), record);
        Ok(())
    }

    async fn get(
        &self,
        saga_id: &SagaId,
    ) -> Result<SagaRecord<D>, StateStoreError<InMemoryStateError>> {
        self.records
            .read()
            .get(saga_id)
            .cloned()
            .ok_or_else(|| StateStoreError::not_found(saga_id.clone()))
    }

    async fn update(
        &self,
        mut record: SagaRecord<D>,
        expected_version: u64,
    ) -> Result<u64, StateStoreError<InMemoryStateError>> {
        let mut records = self.records.write();
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
    ) -> Result<Vec<SagaRecord<D>>, StateStoreError<InMemoryStateError>> {
        if self.fail_next_scan.swap(false, Ordering::SeqCst) {
            return Err(InMemoryStateError::Injected("status scan".to_string()).into());
        }
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, saga_id: &SagaId) -> Result<(), StateStoreError<InMemoryStateError>> {
        self.records
            .write()
            .remove(saga_id)
            .map(|_| ())
            .ok_or_else(|| StateStoreError::not_found(saga_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn record(id: &str, data: u32) -> SagaRecord<u32> {
        SagaRecord::new(SagaId::from(id), "test-definition", data)
    }

    #[tokio::test]
    async fn test_insert_get_roundtrip() {
        let store = InMemorySagaStore::new();
        store.insert(record("s-1", 7)).await.unwrap();

        let loaded = store.get(&SagaId::from("s-1")).await.unwrap();
        assert_eq!(loaded.data, 7);
        assert_eq!(loaded.version, 0);
        assert_eq!(store.saga_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = InMemorySagaStore::new();
        store.insert(record("s-1", 1)).await.unwrap();

        match store.insert(record("s-1", 2)).await {
            Err(StateStoreError::AlreadyExists { saga_id }) => {
                assert_eq!(saga_id, SagaId::from("s-1"))
            }
            other => panic!("expected already exists, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_checks_expected() {
        let store = InMemorySagaStore::new();
        store.insert(record("s-1", 1)).await.unwrap();

        let mut loaded = store.get(&SagaId::from("s-1")).await.unwrap();
        loaded.data = 2;
        let version = store.update(loaded.clone(), 0).await.unwrap();
        assert_eq!(version, 1);

        // a writer presenting the stale version loses
        loaded.data = 3;
        match store.update(loaded, 0).await {
            Err(StateStoreError::Conflict { expected, actual }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let latest = store.get(&SagaId::from("s-1")).await.unwrap();
        assert_eq!(latest.data, 2);
        assert_eq!(latest.version, 1);
    }

    #[tokio::test]
    async fn test_terminal_records_are_immutable() {
        let store = InMemorySagaStore::new();
        let mut rec = record("s-1", 1);
        rec.transition(SagaStatus::Completed);
        store.insert(rec.clone()).await.unwrap();

        rec.data = 99;
        match store.update(rec, 0).await {
            Err(StateStoreError::Terminal { status, .. }) => {
                assert_eq!(status, SagaStatus::Completed)
            }
            other => panic!("expected terminal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_by_status_filters_and_limits() {
        let store = InMemorySagaStore::new();
        for i in 0..5 {
            store.insert(record(&format!("run-{}", i), i)).await.unwrap();
        }
        let mut done = record("done-1", 9);
        done.transition(SagaStatus::Completed);
        store.insert(done).await.unwrap();

        let running = store
            .get_by_status(SagaStatus::Running, 10)
            .await
            .unwrap();
        assert_eq!(running.len(), 5);

        let page = store.get_by_status(SagaStatus::Running, 2).await.unwrap();
        assert_eq!(page.len(), 2);

        let completed = store
            .get_by_status(SagaStatus::Completed, 10)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(store.count_by_status(SagaStatus::Completed), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let store = InMemorySagaStore::new();
        store.insert(record("s-1", 1)).await.unwrap();

        store.delete(&SagaId::from("s-1")).await.unwrap();
        assert_eq!(store.saga_count(), 0);
        assert!(store.delete(&SagaId::from("s-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_scan_failure_is_one_shot() {
        let store = InMemorySagaStore::<u32>::new();
        store.fail_next_scan();

        match store.get_by_status(SagaStatus::Running, 10).await {
            Err(StateStoreError::Backend(InMemoryStateError::Injected(what))) => {
                assert_eq!(what, "status scan")
            }
            other => panic!("expected injected failure, got {:?}", other),
        }
        // next scan works again
        assert!(store.get_by_status(SagaStatus::Running, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_conditional_updates_have_one_winner() {
        let store = Arc::new(InMemorySagaStore::new());
        store.insert(record("s-1", 0)).await.unwrap();
        let base = store.get(&SagaId::from("s-1")).await.unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = Vec::new();
        for n in 1..=2u32 {
            let store = store.clone();
            let barrier = barrier.clone();
            let mut copy = base.clone();
            handles.push(tokio::spawn(async move {
                copy.data = n;
                barrier.wait().await;
                store.update(copy, 0).await
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(StateStoreError::Conflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(wins, 1, "exactly one writer must win");
        assert_eq!(conflicts, 1);

        let latest = store.get(&SagaId::from("s-1")).await.unwrap();
        assert_eq!(latest.version, 1);
    }
}
