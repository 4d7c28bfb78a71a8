//! Logging setup for hosts embedding the orchestrator.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Environment variable that overrides the configured log filter.
pub const LOG_ENV: &str = "TASKFORGE_LOG";

/// Builds the filter: `TASKFORGE_LOG` wins, then the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs a global `tracing` subscriber.
///
/// Returns `false` when a subscriber was already installed (for example by
/// the host application or a previous call), which is not an error.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = env_filter(config);
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    result.is_ok()
}
