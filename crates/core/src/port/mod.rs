//! Port traits connecting the coordinator to storage backends.
//!
//! Each port carries an associated backend error type and a generic
//! `thiserror` wrapper so adapters plug their own failures in without
//! widening the core's error surface.

pub mod idempotency;
pub mod state_store;
pub mod timeout_store;

pub use idempotency::{IdempotencyError, IdempotencyStore};
pub use state_store::{SagaStateStore, StateStoreError};
pub use timeout_store::{SagaTimeout, TimeoutKind, TimeoutStore, TimeoutStoreError};
