//! Logging initialization.
//!
//! Controlled by two environment variables:
//! - `BANDAR_LOG`: an `EnvFilter` directive (default `warn`, or `debug` when
//!   the command line asks for debug output)
//! - `BANDAR_LOG_FORMAT`: `json` for one JSON object per event, anything else
//!   for the human-readable format
//!
//! Events always go to stderr so they never mix with command output.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Environment variable holding the filter directive.
pub const FILTER_ENV: &str = "BANDAR_LOG";

/// Environment variable selecting the output format.
pub const FORMAT_ENV: &str = "BANDAR_LOG_FORMAT";

/// Install the global subscriber. Later calls are ignored.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let json = std::env::var(FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("warning: logging already initialized: {e}");
    }
}
