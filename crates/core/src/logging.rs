//! Structured logging setup for devices, gateways and factory tooling.
//!
//! Protocol code only emits `tracing` events. Binaries pick an output
//! format here once at startup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DIRECTIVES: &str = "info";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install a human-readable subscriber.
///
/// Log level is taken from `RUST_LOG`, falling back to `info`.
///
/// # Example
/// ```no_run
/// use iotkit_core::logging;
///
/// logging::init();
/// tracing::info!("gateway started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(filter(DEFAULT_DIRECTIVES))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Install a JSON subscriber for log collectors.
///
/// # Example
/// ```no_run
/// use iotkit_core::logging;
///
/// logging::init_json();
/// tracing::info!(service = "FLDT", "file type registered");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(filter(DEFAULT_DIRECTIVES))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Install a subscriber writing through the test harness capture.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(filter("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
