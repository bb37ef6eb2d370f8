// Structured logging to stderr.
//
// Priority: RUST_LOG env var > --debug flag > config `log.level` > "info".
// Bearer tokens are never logged at any level.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_LEVEL: &str = "info";

pub fn init(debug_flag: bool, config_level: Option<&str>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if debug_flag {
        EnvFilter::new("debug")
    } else if let Some(level) = config_level.filter(|level| !level.trim().is_empty()) {
        EnvFilter::new(level)
    } else {
        EnvFilter::new(DEFAULT_LEVEL)
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();

    tracing::debug!(version = crate::VERSION, "logging initialised");
}
