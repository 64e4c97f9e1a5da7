//! Logging setup for the command-line tool.
//!
//! Diagnostics go to stderr so stdout stays clean for reports and `--json` output.
//! The level is read from `WILDCLEAN_LOG` (e.g. `WILDCLEAN_LOG=debug` to see every
//! per-file decision), defaulting to `info`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "WILDCLEAN_LOG";

pub fn init(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (e.g. from tests) is harmless.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
