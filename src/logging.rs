//! Diagnostic logging.
//!
//! `tracing` events go to stderr through `tracing-subscriber`, filtered by
//! `RUST_LOG` (default `info`, or `debug` with `--verbose`). Progress lines
//! and command output are separate: see [`crate::progress`].

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Safe to call more than once.
pub fn init_logging(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
