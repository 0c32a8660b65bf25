//! Logging and tracing utilities

use crate::config::{LogFormat, LoggingSettings};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber with default configuration
pub fn init_tracing() {
    init_tracing_with(&LoggingSettings::default());
}

/// Initialize tracing subscriber from logging settings
///
/// `RUST_LOG` takes precedence over `settings.level`.
pub fn init_tracing_with(settings: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    match settings.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
