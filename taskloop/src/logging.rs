//! Diagnostic tracing.
//!
//! Tracing output goes to stderr and is controlled by `RUST_LOG`. It is
//! separate from the per-session progress log and iteration artifacts, which
//! are always written.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `warn`, or
/// `taskloop=debug` with `verbose`.
///
/// ```bash
/// RUST_LOG=taskloop=debug taskloop run
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "warn,taskloop=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
