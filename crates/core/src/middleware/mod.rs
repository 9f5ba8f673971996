//! Dispatch middleware: routes inbound transport messages to the
//! orchestrator.
//!
//! A message addressed to an unknown saga id starts a new saga from the
//! message payload; a message for a live saga resumes it by executing its
//! next step; a message for a finished saga is ignored. Transports (queue
//! consumers, HTTP handlers) implement their own decode into
//! [`InboundSagaMessage`] and hand the rest to [`SagaMiddleware`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::codec::PayloadCodec;
use crate::error::SagaError;
use crate::orchestrator::SagaOrchestrator;
use crate::port::idempotency::IdempotencyStore;
use crate::port::state_store::SagaStateStore;
use crate::port::timeout_store::TimeoutStore;
use crate::saga::SagaId;

/// One message lifted off a transport, addressed to a saga instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSagaMessage {
    /// Correlation id; doubles as the saga id for new sagas.
    pub saga_id: SagaId,
    /// Definition name used when the message starts a new saga.
    pub saga_type: String,
    /// Delivery identity for the idempotency guard, e.g. the transport's
    /// message id.
    pub dedup_key: String,
    /// Encoded initial payload; required only for messages that start a
    /// saga.
    pub payload: Option<Vec<u8>>,
}

impl InboundSagaMessage {
    pub fn new(
        saga_id: impl Into<SagaId>,
        saga_type: impl Into<String>,
        dedup_key: impl Into<String>,
    ) -> Self {
        Self {
            saga_id: saga_id.into(),
            saga_type: saga_type.into(),
            dedup_key: dedup_key.into(),
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// What the middleware did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No saga existed; one was started from the message payload.
    Started,
    /// The saga existed and its next step was driven. Duplicate deliveries
    /// are absorbed by the idempotency guard and still report `Resumed`.
    Resumed,
    /// The saga already finished; the message was dropped.
    Ignored,
}

/// Message entry point implemented by the middleware (and by test doubles).
#[async_trait]
pub trait SagaDispatch: Send + Sync {
    async fn dispatch(&self, message: InboundSagaMessage) -> Result<DispatchOutcome, SagaError>;
}

/// Default dispatch implementation over an orchestrator and a payload codec.
pub struct SagaMiddleware<D, S, T, I, C>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
    T: TimeoutStore,
    I: IdempotencyStore,
    C: PayloadCodec<D>,
{
    orchestrator: Arc<SagaOrchestrator<D, S, T, I>>,
    codec: C,
}

impl<D, S, T, I, C> SagaMiddleware<D, S, T, I, C>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
    T: TimeoutStore,
    I: IdempotencyStore,
    C: PayloadCodec<D>,
{
    pub fn new(orchestrator: Arc<SagaOrchestrator<D, S, T, I>>, codec: C) -> Self {
        Self {
            orchestrator,
            codec,
        }
    }
}

#[async_trait]
impl<D, S, T, I, C> SagaDispatch for SagaMiddleware<D, S, T, I, C>
where
    D: Clone + Send + Sync + 'static,
    S: SagaStateStore<D>,
    T: TimeoutStore,
    I: IdempotencyStore,
    C: PayloadCodec<D>,
{
    async fn dispatch(&self, message: InboundSagaMessage) -> Result<DispatchOutcome, SagaError> {
        match self.orchestrator.get(&message.saga_id).await {
            Ok(record) => {
                if record.is_terminal() {
                    debug!(
                        saga_id = %message.saga_id,
                        status = %record.status,
                        "message for finished saga ignored"
                    );
                    return Ok(DispatchOutcome::Ignored);
                }
                self.orchestrator
                    .execute_next_step(&message.saga_id, &message.dedup_key)
                    .await?;
                Ok(DispatchOutcome::Resumed)
            }
            Err(SagaError::NotFound { .. }) => {
                let Some(payload) = message.payload.as_deref() else {
                    return Err(SagaError::invalid_argument(format!(
                        "message for unknown saga {} carries no initial payload",
                        message.saga_id
                    )));
                };
                let initial = self.codec.decode(payload).map_err(|err| {
                    SagaError::invalid_argument(format!("initial payload decode failed: {}", err))
                })?;
                self.orchestrator
                    .start_with_id(
                        message.saga_id.clone(),
                        &message.saga_type,
                        initial,
                        &message.dedup_key,
                    )
                    .await?;
                info!(
                    saga_id = %message.saga_id,
                    saga_type = %message.saga_type,
                    "saga started from inbound message"
                );
                Ok(DispatchOutcome::Started)
            }
            Err(err) => Err(err),
        }
    }
}
