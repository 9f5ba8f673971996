//! # sagakit-memory
//!
//! In-memory adapters for the `sagakit-core` store ports, plus a bundle
//! that wires a complete coordinator on top of them. Intended for tests,
//! examples, and single-process deployments where durability across
//! restarts is not required.

use std::sync::Arc;

use sagakit_core::config::CoordinatorConfig;
use sagakit_core::orchestrator::SagaOrchestrator;

pub mod idempotency;
pub mod state_store;
pub mod timeout_store;

pub use idempotency::{InMemoryGuardError, InMemoryIdempotencyStore};
pub use state_store::{InMemorySagaStore, InMemoryStateError};
pub use timeout_store::{InMemoryTimeoutError, InMemoryTimeoutStore};

/// Orchestrator specialized to the in-memory adapters.
pub type InMemoryOrchestrator<D> =
    SagaOrchestrator<D, InMemorySagaStore<D>, InMemoryTimeoutStore, InMemoryIdempotencyStore>;

/// A fully wired in-memory coordinator with handles to its stores.
///
/// The store handles stay accessible so tests can inspect pending timeouts,
/// count records, or inject failures while driving the orchestrator.
pub struct InMemoryCoordinator<D>
where
    D: Clone + Send + Sync + 'static,
{
    pub orchestrator: Arc<InMemoryOrchestrator<D>>,
    pub state_store: Arc<InMemorySagaStore<D>>,
    pub timeout_store: Arc<InMemoryTimeoutStore>,
    pub idempotency: Arc<InMemoryIdempotencyStore>,
}

impl<D> InMemoryCoordinator<D>
where
    D: Clone + Send + Sync + 'static,
{
    pub fn new(config: CoordinatorConfig) -> Self {
        let state_store = Arc::new(InMemorySagaStore::new());
        let timeout_store = Arc::new(InMemoryTimeoutStore::new());
        let idempotency = Arc::new(InMemoryIdempotencyStore::new());
        let orchestrator = Arc::new(SagaOrchestrator::new(
            config,
            state_store.clone(),
            timeout_store.clone(),
            idempotency.clone(),
        ));
        Self {
            orchestrator,
            state_store,
            timeout_store,
            idempotency,
        }
    }
}

impl<D> Default for InMemoryCoordinator<D>
where
    D: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}
