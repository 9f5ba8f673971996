//! Tracing bootstrap for binaries embedding the coordinator.
//!
//! Library code only emits `tracing` events; hosts decide where they go.
//! [`init_telemetry`] wires a sensible default subscriber (env-filtered,
//! human-readable) for services that do not bring their own.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name reported in logs.
    pub service_name: String,
    /// Service version reported in logs.
    pub service_version: String,
    /// Log level filter directive, e.g. `info` or `sagakit_core=debug`.
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "sagakit".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    #[must_use]
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }
}

/// Guard returned by [`init_telemetry`]. Hold it for the lifetime of the
/// process; dropping it is harmless today but keeps room for flush-on-exit.
pub struct TelemetryGuard;

impl TelemetryGuard {
    pub fn shutdown(self) {}
}

/// Install the default tracing subscriber.
///
/// Respects `RUST_LOG` when set, otherwise falls back to the configured
/// level. Safe to call more than once; later calls keep the first
/// subscriber.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let _ = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "telemetry initialized"
    );

    TelemetryGuard
}
