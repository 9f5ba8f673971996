//! # sagakit-core
//!
//! A saga coordinator for distributed, multi-step transactions: ordered
//! steps with compensating actions, durable state with optimistic locking,
//! durable timeouts with at-least-once delivery, and background recovery
//! services.
//!
//! The crate is transport- and storage-agnostic. Persistence goes through
//! three ports ([`port::SagaStateStore`], [`port::TimeoutStore`],
//! [`port::IdempotencyStore`]); `sagakit-memory` ships in-memory adapters
//! for tests and single-process deployments.
//!
//! ## Defining a saga
//!
//! ```
//! use sagakit_core::workflow::{RetryPolicy, SagaDefinition, SagaStep, StepError};
//!
//! #[derive(Clone)]
//! struct Order {
//!     reserved: bool,
//!     charged: bool,
//! }
//!
//! let definition: SagaDefinition<Order> = SagaDefinition::builder("order-fulfilment")
//!     .step(SagaStep::new(
//!         "reserve-inventory",
//!         |mut order: Order| async move {
//!             order.reserved = true;
//!             Ok::<_, StepError>(order)
//!         },
//!         |mut order: Order| async move {
//!             order.reserved = false;
//!             Ok::<_, StepError>(order)
//!         },
//!     ))
//!     .step(SagaStep::new(
//!         "charge-payment",
//!         |mut order: Order| async move {
//!             order.charged = true;
//!             Ok::<_, StepError>(order)
//!         },
//!         |mut order: Order| async move {
//!             order.charged = false;
//!             Ok::<_, StepError>(order)
//!         },
//!     ))
//!     .retry_policy(RetryPolicy::default())
//!     .build();
//!
//! assert_eq!(definition.step_count(), 2);
//! ```
//!
//! Registered definitions are driven by the [`orchestrator::SagaOrchestrator`]:
//! `start` persists a new record and runs the first step, inbound messages
//! and due timeouts drive the rest, and a permanent step failure rolls back
//! the completed steps in reverse order.

pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod middleware;
pub mod orchestrator;
pub mod port;
pub mod saga;
pub mod service;
pub mod telemetry;
pub mod workflow;

pub use codec::{BincodeCodec, CodecError, JsonCodec, PayloadCodec};
pub use config::{CleanupConfig, CoordinatorConfig, DeliveryConfig, EnvConfig, HealthConfig};
pub use error::SagaError;
pub use health::{HealthCheck, HealthInfo, HealthStatus, SagaHealth, SagaHealthMonitor};
pub use middleware::{DispatchOutcome, InboundSagaMessage, SagaDispatch, SagaMiddleware};
pub use orchestrator::{OrchestratorMetricsSnapshot, SagaOrchestrator};
pub use port::idempotency::{IdempotencyError, IdempotencyStore};
pub use port::state_store::{SagaStateStore, StateStoreError};
pub use port::timeout_store::{SagaTimeout, TimeoutKind, TimeoutStore, TimeoutStoreError};
pub use saga::{CompensationResult, SagaActivity, SagaId, SagaRecord, SagaStatus};
pub use service::{CleanupService, TimeoutDeliveryService};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use workflow::{
    RetryDecision, RetryPolicy, SagaDefinition, SagaDefinitionBuilder, SagaStep, StepError,
    StepErrorKind,
};
