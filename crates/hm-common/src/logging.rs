//! Logging setup.
//!
//! Output format and filtering are driven by [`LoggingConfig`] rather than
//! read ad hoc: hosts fill it from their configuration (hm-messaging maps
//! its `[logging]` section here) or pick up the `HM_LOG` /
//! `HM_LOG_FORMAT` environment variables via [`LoggingConfig::from_env`].

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Subscriber output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output for development.
    Text,
    /// Flattened JSON events for log aggregation.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "plain" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// An `EnvFilter` directive string, e.g. `"info"` or
    /// `"hm_pipeline=trace,hm_outbox=info"`.
    pub filter: String,
    /// Emit file/line fields (JSON output only pays for this by default).
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".to_string(),
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// Configuration from `HM_LOG_FORMAT` (text/json) and `HM_LOG`
    /// (filter directives). Unset or unparsable values fall back to the
    /// defaults.
    pub fn from_env() -> Self {
        let format = std::env::var("HM_LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(LogFormat::Text);
        let filter = std::env::var("HM_LOG").unwrap_or_else(|_| "info".to_string());
        Self {
            format,
            filter,
            include_location: format == LogFormat::Json,
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_location(mut self, include_location: bool) -> Self {
        self.include_location = include_location;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber described by `config`. Fails if a
/// subscriber is already installed (re-initialisation in tests, embedded
/// hosts that configured their own).
pub fn try_init(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_env_filter(config.env_filter())
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_target(true)
            .with_env_filter(config.env_filter())
            .try_init(),
    }
}

/// Like [`try_init`], but a second initialisation is a no-op instead of an
/// error, keeping whatever subscriber got there first.
pub fn init(config: &LoggingConfig) {
    let _ = try_init(config);
}
