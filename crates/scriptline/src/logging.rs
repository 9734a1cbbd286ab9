//! Process-wide tracing setup.
//!
//! Library code emits through `tracing` and, in the persistence layer,
//! through the `log` facade. `init` installs one subscriber for both.

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Builds the filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. Later calls are no-ops, as is a call
/// made after some other subscriber was already installed.
pub fn init(config: &LoggingConfig) {
    INITIALIZED.get_or_init(|| {
        // Another logger (e.g. a test harness) may already own `log`.
        let _ = tracing_log::LogTracer::init();

        let filter = env_filter(config);
        let result = match config.format {
            LogFormat::Json => tracing::subscriber::set_global_default(
                Registry::default()
                    .with(filter)
                    .with(fmt::layer().json().with_current_span(true)),
            ),
            LogFormat::Pretty => tracing::subscriber::set_global_default(
                Registry::default()
                    .with(filter)
                    .with(fmt::layer().with_target(true)),
            ),
        };
        if result.is_err() {
            tracing::debug!("Global tracing subscriber already installed");
        }
    });
}
