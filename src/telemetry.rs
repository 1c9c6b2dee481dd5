//! Operator diagnostics via `tracing`.
//!
//! The audit log is the forensic record. Everything emitted here is for
//! whoever is watching stderr.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Calling this twice is harmless; the second call is ignored.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    if result.is_ok() {
        tracing::debug!(json, "logging initialized");
    }
}

/// Correlation id for requests that arrive without one.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
