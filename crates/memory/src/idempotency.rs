//! In-memory idempotency guard.
//!
//! Processed (saga id, dedup key) pairs in a `HashSet` per saga. Marking is
//! idempotent, so redelivered messages converge on a single processed entry
//! no matter how often they arrive.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use sagakit_core::port::idempotency::{ensure_valid_key, IdempotencyError, IdempotencyStore};
use sagakit_core::saga::SagaId;

/// Backend error for the in-memory guard; it has no failure modes of its
/// own (closure surfaces as [`IdempotencyError::Cancelled`]).
#[derive(Debug, thiserror::Error)]
pub enum InMemoryGuardError {}

/// In-memory [`IdempotencyStore`] adapter.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    processed: RwLock<HashMap<SagaId, HashSet<String>>>,
    closed: AtomicBool,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse all further operations with `Cancelled`. Mirrors a backend
    /// whose connection pool was shut down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.processed.write().clear();
    }

    fn ensure_open(&self) -> Result<(), IdempotencyError<InMemoryGuardError>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IdempotencyError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    type Error = InMemoryGuardError;

    async fn is_processed(
        &self,
        saga_id: &SagaId,
        key: &str,
    ) -> Result<bool, IdempotencyError<InMemoryGuardError>> {
        ensure_valid_key(saga_id, key)?;
        self.ensure_open()?;
        Ok(self
            .processed
            .read()
            .get(saga_id)
            .map(|keys| keys.contains(key))
            .unwrap_or(false))
    }

    async fn mark_processed(
        &self,
        saga_id: &SagaId,
        key: &str,
    ) -> Result<(), IdempotencyError<InMemoryGuardError>> {
        ensure_valid_key(saga_id, key)?;
        self.ensure_open()?;
        self.processed
            .write()
            .entry(saga_id.clone())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    async fn processed_count(
        &self,
        saga_id: &SagaId,
    ) -> Result<usize, IdempotencyError<InMemoryGuardError>> {
        self.ensure_open()?;
        Ok(self
            .processed
            .read()
            .get(saga_id)
            .map(|keys| keys.len())
            .unwrap_or(0))
    }
}
