//! Subscriber setup and span timing.

use crate::config::LoggingConfig;
use crate::errors::ConfigError;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Builds the log filter: `RUST_LOG` if set, otherwise the configured level.
///
/// # Errors
///
/// Returns a parse error if the configured directive is invalid.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| ConfigError::Parse(format!("invalid log level '{}': {e}", config.level)))
}

/// Installs the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed.
///
/// # Errors
///
/// Returns an error if the log level directive is invalid.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, ConfigError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if config.json {
        builder.json().with_current_span(false).try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    Ok(installed)
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in whole milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span, logs it at debug level and returns the duration.
    pub fn finish(self) -> u64 {
        let duration_ms = self.elapsed_ms();
        tracing::debug!(span_name = %self.name, duration_ms, "span finished");
        duration_ms
    }
}
