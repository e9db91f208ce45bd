//! Logging initialization.
//!
//! Everything in the workspace logs through `tracing`. Binaries and tests
//! install a subscriber once with [`init_logging`].

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "rowcache_core=info,rowcache_storage=info,warn";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `rowcache_storage=debug`
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    /// Reads `ROWCACHE_LOG` and `ROWCACHE_LOG_FORMAT` (`json` or `pretty`).
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var("ROWCACHE_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
            format: std::env::var("ROWCACHE_LOG_FORMAT")
                .map(|s| parse_format(&s))
                .unwrap_or_default(),
        }
    }
}

fn parse_format(value: &str) -> LogFormat {
    if value.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    }
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_logging(config: &LogConfig) -> bool {
    let env_filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    }
    .is_ok();

    if installed {
        tracing::debug!(filter = %config.filter, format = ?config.format, "logging initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("json"), LogFormat::Json);
        assert_eq!(parse_format("JSON"), LogFormat::Json);
        assert_eq!(parse_format("pretty"), LogFormat::Pretty);
        assert_eq!(parse_format("anything"), LogFormat::Pretty);
    }

    #[test]
    fn test_second_init_is_harmless() {
        let config = LogConfig::default();
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
