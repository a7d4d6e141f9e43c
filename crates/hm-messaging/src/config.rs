//! Configuration with TOML file and environment variable support.

use std::path::Path;
use std::time::Duration;

use hm_common::logging::{LogFormat, LoggingConfig};
use hm_common::MessagingError;
use hm_outbox::OutboxProcessorConfig;
use hm_pipeline::DispatcherConfig;
use hm_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub command_concurrency: usize,
    pub query_concurrency: usize,
    pub event_concurrency: usize,
    pub queue_capacity: usize,
    pub dead_letter_failed_events: bool,
    pub default_timeout_ms: Option<u64>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let defaults = DispatcherConfig::default();
        Self {
            command_concurrency: defaults.command_concurrency,
            query_concurrency: defaults.query_concurrency,
            event_concurrency: defaults.event_concurrency,
            queue_capacity: defaults.queue_capacity,
            dead_letter_failed_events: defaults.dead_letter_failed_events,
            default_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    pub enabled: bool,
    pub success_ttl_secs: u64,
    pub failure_ttl_secs: u64,
    pub cache_failures: bool,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            success_ttl_secs: 24 * 60 * 60,
            failure_ttl_secs: 60 * 60,
            cache_failures: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub lease_secs: u64,
    pub default_destination: String,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        let defaults = OutboxProcessorConfig::default();
        Self {
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            batch_size: defaults.batch_size,
            lease_secs: defaults.lease_duration.as_secs(),
            default_destination: defaults.default_destination,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_ms: u64,
    pub batch_limit: usize,
    pub past_due_grace_secs: u64,
    pub default_queue: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            tick_ms: defaults.tick.as_millis() as u64,
            batch_limit: defaults.batch_limit,
            past_due_grace_secs: defaults.past_due_grace.as_secs(),
            default_queue: defaults.default_queue,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// "text" or "json".
    pub format: String,
    /// `EnvFilter` directives, e.g. "info" or "hm_outbox=debug".
    pub filter: String,
    pub include_location: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
            filter: "info".to_string(),
            include_location: false,
        }
    }
}

/// Root configuration, loadable from TOML with environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub logging: LoggingSettings,
    pub dispatcher: DispatcherSettings,
    pub idempotency: IdempotencySettings,
    pub retry: RetrySettings,
    pub outbox: OutboxSettings,
    pub scheduler: SchedulerSettings,
}

impl MessagingConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MessagingError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MessagingError::Config(format!("failed to read config file: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| MessagingError::Config(format!("failed to parse config file: {e}")))
    }

    /// Defaults, then the config file (if present), then `HM_*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, MessagingError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                info!(path = %p.display(), "loading messaging configuration from file");
                Self::from_file(p)?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = parse_env("HM_COMMAND_CONCURRENCY") {
            self.dispatcher.command_concurrency = v;
        }
        if let Some(v) = parse_env("HM_QUEUE_CAPACITY") {
            self.dispatcher.queue_capacity = v;
        }
        if let Some(v) = parse_env("HM_OUTBOX_POLL_INTERVAL_MS") {
            self.outbox.poll_interval_ms = v;
        }
        if let Some(v) = parse_env("HM_SCHEDULER_TICK_MS") {
            self.scheduler.tick_ms = v;
        }
        if let Some(v) = parse_env("HM_RETRY_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Ok(v) = std::env::var("HM_LOG_FORMAT") {
            self.logging.format = v;
        }
        if let Ok(v) = std::env::var("HM_LOG") {
            self.logging.filter = v;
        }
    }

    pub fn logging_config(&self) -> LoggingConfig {
        let format = self
            .logging
            .format
            .parse()
            .unwrap_or(LogFormat::Text);
        LoggingConfig::default()
            .with_format(format)
            .with_filter(self.logging.filter.clone())
            .with_location(self.logging.include_location)
    }

    /// Install the logging subscriber described by the `[logging]` section.
    /// A subscriber installed earlier (tests, embedding hosts) wins.
    pub fn init_logging(&self) {
        hm_common::logging::init(&self.logging_config());
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            command_concurrency: self.dispatcher.command_concurrency,
            query_concurrency: self.dispatcher.query_concurrency,
            event_concurrency: self.dispatcher.event_concurrency,
            queue_capacity: self.dispatcher.queue_capacity,
            dead_letter_failed_events: self.dispatcher.dead_letter_failed_events,
            default_timeout: self.dispatcher.default_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn outbox_config(&self) -> OutboxProcessorConfig {
        OutboxProcessorConfig {
            poll_interval: Duration::from_millis(self.outbox.poll_interval_ms),
            batch_size: self.outbox.batch_size,
            lease_duration: Duration::from_secs(self.outbox.lease_secs),
            default_destination: self.outbox.default_destination.clone(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(self.scheduler.tick_ms),
            batch_limit: self.scheduler.batch_limit,
            past_due_grace: Duration::from_secs(self.scheduler.past_due_grace_secs),
            default_queue: self.scheduler.default_queue.clone(),
        }
    }
}
