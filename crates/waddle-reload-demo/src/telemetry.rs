//! Log setup for the demo server.
//!
//! Console output through `tracing-subscriber`, filtered by `RUST_LOG`
//! (default: `info,waddle_reloader=debug,waddle_reload_demo=debug`).
//! Old and new processes share stdout during a restart; `main` runs inside
//! a `process{pid=..}` span to tell them apart.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,waddle_reloader=debug,waddle_reload_demo=debug";

/// Install the global subscriber. `json` switches to one JSON object per line.
pub fn init(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?;
    }

    tracing::info!(json, "Telemetry initialized");
    Ok(())
}

/// Flush logs before exit.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}
