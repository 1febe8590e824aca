use std::str::FromStr;

use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Initialize the logging subsystem. The log level is taken from the
/// `RUST_LOG` environment variable, falling back to the level given here.
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logger(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(
            LevelFilter::from_str(level)
                .unwrap_or(LevelFilter::INFO)
                .into(),
        )
    });

    // A second init (e.g. from a test) is not an error worth reporting.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
