//! Tracing setup shared by the CLI and the server.
//!
//! Diagnostics go to stderr so CLI output on stdout stays machine-readable.
//! `RUST_LOG` wins over everything; otherwise `default_filter` is used, or
//! `debug` when the `DEBUG` flag is set.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter for the CLI.
pub const CLI_FILTER: &str = "warn";
/// Default filter for the server.
pub const SERVER_FILTER: &str = "mitosis=info,mitosis_server=info";

/// Initialize the global subscriber. Safe to call more than once; later calls
/// are ignored.
///
/// # Example
/// ```bash
/// RUST_LOG=mitosis=debug mitosis run "research rust async runtimes"
/// ```
pub fn init(default_filter: &str, debug: bool) {
    let fallback = if debug { "debug" } else { default_filter };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
