//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise INFO is used, or DEBUG when `verbose` is set.
pub fn init(verbose: bool) {
    let default_level = if verbose {
        filter::LevelFilter::DEBUG
    } else {
        filter::LevelFilter::INFO
    };
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
}
