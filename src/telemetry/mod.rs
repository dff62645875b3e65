//! Telemetry setup, available with the `telemetry` feature.
//!
//! The call machinery itself only emits [`tracing`] events and spans:
//! a `grpc.server.call` span per server call and a `grpc.client.call` span
//! per client call. Installing a subscriber is left to the application,
//! [`init_tracing`] does so the way rama binaries do.

use tracing_subscriber::{
    EnvFilter, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::error::BoxError;

/// Install a global fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Fails if a global subscriber was already installed.
pub fn init_tracing() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()?;
    Ok(())
}
