//! Logging setup. Grounded on the teacher's `telemetry`/tracing-subscriber init.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a global `tracing` subscriber reading its filter from `RUST_LOG`
/// (default `info`). JSON output when `FUEL_CODE_LOG_JSON` is set, otherwise
/// human-readable — matching the teacher's `tracing-subscriber` fmt/json split.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("FUEL_CODE_LOG_JSON").is_ok();
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
