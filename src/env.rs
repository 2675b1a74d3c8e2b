//! Environment variable names used by this crate for convenient
//! configuration of the appender from services.
//!
//! These are purely helpers; the core types remain decoupled from
//! environment access.

use crate::appender::AppenderConfig;
use crate::locator::ConfigError;
use std::time::Duration;

/// Connection string, e.g. `Server=localhost;Port=9200;Index=logs;Rolling=true`.
pub const ELASTIC_SINK_CONNECTION_STRING_ENV: &str = "ELASTIC_SINK_CONNECTION_STRING";

/// Host buffer size; `<= 1` ships every event on its own.
pub const ELASTIC_SINK_BUFFER_SIZE_ENV: &str = "ELASTIC_SINK_BUFFER_SIZE";

/// Appender name used in error reports.
pub const ELASTIC_SINK_NAME_ENV: &str = "ELASTIC_SINK_NAME";

/// Close drain timeout in milliseconds.
pub const ELASTIC_SINK_CLOSE_TIMEOUT_MS_ENV: &str = "ELASTIC_SINK_CLOSE_TIMEOUT_MS";

/// Rolling index date pattern, e.g. `yyyy.MM.dd`.
pub const ELASTIC_SINK_DATE_FORMAT_ENV: &str = "ELASTIC_SINK_DATE_FORMAT";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppenderConfig {
    /// Build a config from `ELASTIC_SINK_*` variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppenderConfig::default();

        if let Some(cs) = lookup(ELASTIC_SINK_CONNECTION_STRING_ENV) {
            config.connection_string = cs;
        }
        if let Some(name) = lookup(ELASTIC_SINK_NAME_ENV) {
            config.name = name;
        }
        if let Some(raw) = lookup(ELASTIC_SINK_BUFFER_SIZE_ENV) {
            config.buffer_size = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidBufferSize(raw.clone()))?;
        }
        if let Some(raw) = lookup(ELASTIC_SINK_CLOSE_TIMEOUT_MS_ENV) {
            let ms: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ELASTIC_SINK_CLOSE_TIMEOUT_MS_ENV,
                value: raw.clone(),
            })?;
            config.on_close_timeout = Duration::from_millis(ms);
        }
        if let Some(format) = lookup(ELASTIC_SINK_DATE_FORMAT_ENV) {
            config.rolling_index_date_format = format;
        }

        Ok(config)
    }
}
