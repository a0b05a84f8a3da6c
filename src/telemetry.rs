//! Tracing initialization for the peer binary.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber: compact stderr output, filter from
/// `ORDERCAST_LOG` with a default level taken from the `-v` count.
/// Safe to call more than once (later calls are no-ops), which keeps
/// tests that share a process happy.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("ORDERCAST_LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(filter)
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::INFO,
        1 => tracing::metadata::LevelFilter::DEBUG,
        _ => tracing::metadata::LevelFilter::TRACE,
    }
}
