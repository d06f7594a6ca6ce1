//! Tracing subscriber setup

use ldap_proxy_core::config::{LogFormat, LoggingConfig};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Install the global subscriber. Must run before the async runtime starts:
/// it exports the configured timezone as `TZ` for local timestamps.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    if let Some(tz) = &config.timezone {
        std::env::set_var("TZ", tz);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.effective_level()));
    let timer = ChronoLocal::new(TIMESTAMP_FORMAT.to_string());

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_timer(timer))
            .with(filter)
            .try_init()?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_timer(timer))
            .with(filter)
            .try_init()?,
    }

    Ok(())
}
