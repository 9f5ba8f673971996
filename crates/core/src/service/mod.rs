//! Background services that keep the coordinator healthy: timeout delivery
//! and the cleanup sweep.
//!
//! Both run as cancellable ticker loops: a `tokio::select!` over a broadcast
//! shutdown channel and an interval tick. One cycle of work is a plain async
//! method (`process_batch`, `sweep`) so tests drive cycles directly with a
//! chosen clock instead of spawning the loop.

pub mod cleanup;
pub mod timeout_delivery;

pub use cleanup::{is_stale, CleanupMetricsSnapshot, CleanupService, SweepResult};
pub use timeout_delivery::{DeliveryMetricsSnapshot, DeliveryResult, TimeoutDeliveryService};
