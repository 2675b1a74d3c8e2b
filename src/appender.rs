use crate::dispatch::DispatchCoordinator;
use crate::error_handler::ErrorHandler;
use crate::locator::{
    keys, Clock, ConfigError, ConnectionDescriptor, DatePattern, SystemClock, TargetLocator, DEFAULT_DATE_FORMAT,
};
use crate::record::LogEvent;
use crate::repository::ShippingRepository;
use crate::transform::{FieldNameOverride, FieldTransform, FieldValueReplica};
use crate::transport::{HttpTransport, Transport, TransportError};
use serde::Deserialize;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

pub const DEFAULT_ON_CLOSE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Activation options of an [`ElasticAppender`].
///
/// **Fields**
/// - `connection_string`: `Server=..;Index=..;...` descriptor.
/// - `buffer_size`: host buffering size; appended to the descriptor as
///   `BufferSize`, it selects single (`<= 1`) or bulk writes.
/// - `on_close_timeout`: how long [`ElasticAppender::close`] waits for
///   in-flight sends.
/// - `rolling_index_date_format`: date suffix pattern for rolling indices.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppenderConfig {
    pub name: String,
    pub connection_string: String,
    pub buffer_size: usize,
    #[serde(with = "millis")]
    pub on_close_timeout: Duration,
    pub rolling_index_date_format: String,
    pub field_name_overrides: Vec<FieldNameOverride>,
    pub field_value_replicas: Vec<FieldValueReplica>,
    pub accept_invalid_certs: bool,
    #[serde(with = "opt_millis")]
    pub request_timeout: Option<Duration>,
}

impl Default for AppenderConfig {
    fn default() -> Self {
        Self {
            name: "elastic".to_string(),
            connection_string: String::new(),
            buffer_size: 512,
            on_close_timeout: DEFAULT_ON_CLOSE_TIMEOUT,
            rolling_index_date_format: DEFAULT_DATE_FORMAT.to_string(),
            field_name_overrides: Vec::new(),
            field_value_replicas: Vec::new(),
            accept_invalid_certs: false,
            request_timeout: None,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

impl AppenderConfig {
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    /// Connection string as handed to the locator: the configured one with
    /// the active buffer size appended.
    pub fn effective_connection_string(&self) -> String {
        format!(
            "{};{}={}",
            self.connection_string.trim_end_matches(';'),
            keys::BUFFER_SIZE,
            self.buffer_size
        )
    }
}

/// Failure of [`ElasticAppender::activate`].
#[derive(thiserror::Error, Debug)]
pub enum ActivationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Host-facing entry point: activation, per-buffer flush and close.
pub struct ElasticAppender {
    config: AppenderConfig,
    coordinator: DispatchCoordinator,
}

impl ElasticAppender {
    /// Validate the configuration and wire up locator, transport,
    /// repository and coordinator with the default HTTP transport.
    ///
    /// **Errors**
    /// - [`ActivationError::Config`] for an empty or invalid connection
    ///   string or date format.
    /// - [`ActivationError::Transport`] when the HTTP client cannot be built.
    ///
    /// Either is also reported to `error_handler`; nothing is ever sent.
    pub fn activate(
        config: AppenderConfig,
        runtime: Handle,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self, ActivationError> {
        let transform = FieldTransform::new(&config.field_name_overrides, &config.field_value_replicas);
        let transport =
            match HttpTransport::build(Arc::new(transform), config.accept_invalid_certs, config.request_timeout) {
                Ok(transport) => transport,
                Err(e) => {
                    report(&config.name, error_handler.as_ref(), "Failed to build HTTP transport in activate.", &e);
                    return Err(e.into());
                }
            };
        let appender = Self::assemble(config, runtime, error_handler, Arc::new(transport), Arc::new(SystemClock))?;
        Ok(appender)
    }

    /// Like [`activate`](Self::activate) with an explicit transport and clock.
    ///
    /// The caller's transport owns the HTTP settings: `field_name_overrides`,
    /// `field_value_replicas`, `accept_invalid_certs` and `request_timeout`
    /// are not applied here.
    pub fn activate_with(
        config: AppenderConfig,
        runtime: Handle,
        error_handler: Arc<dyn ErrorHandler>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if transport_settings_set(&config) {
            debug!(
                appender = %config.name,
                "field transforms, TLS and timeout settings are left to the supplied transport"
            );
        }
        Self::assemble(config, runtime, error_handler, transport, clock)
    }

    fn assemble(
        config: AppenderConfig,
        runtime: Handle,
        error_handler: Arc<dyn ErrorHandler>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let locator = match build_locator(&config, clock) {
            Ok(locator) => locator,
            Err(e) => {
                report(&config.name, error_handler.as_ref(), "Failed to validate connection string in activate.", &e);
                return Err(e);
            }
        };

        info!(
            appender = %config.name,
            target_url = %locator.resolve(),
            mode = ?locator.write_mode(),
            "elastic appender activated"
        );

        let repository = ShippingRepository::new(locator, transport);
        let coordinator = DispatchCoordinator::new(Arc::new(repository), error_handler, config.name.clone(), runtime);
        Ok(ElasticAppender { config, coordinator })
    }

    pub fn config(&self) -> &AppenderConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &DispatchCoordinator {
        &self.coordinator
    }

    /// Hand a full buffer over for asynchronous shipping. Never blocks.
    pub fn send_buffer(&self, events: Vec<LogEvent>) {
        self.coordinator.flush(events);
    }

    /// Wait up to `on_close_timeout` for in-flight sends.
    ///
    /// **Returns**
    /// - `true` if everything finished in time; otherwise the timeout is
    ///   reported to the error handler and `false` is returned.
    pub async fn close(&self) -> bool {
        match self.coordinator.close(self.config.on_close_timeout).await {
            Ok(()) => true,
            Err(e) => {
                self.coordinator
                    .report("Failed to send all queued events in close", Some(&e));
                false
            }
        }
    }

    /// Blocking [`close`](Self::close) for synchronous shutdown hooks.
    pub fn close_blocking(&self) -> bool {
        if self.coordinator.drain_blocking(self.config.on_close_timeout) {
            return true;
        }
        let e = crate::dispatch::DrainTimeout {
            pending: self.coordinator.in_flight(),
            timeout: self.config.on_close_timeout,
        };
        self.coordinator
            .report("Failed to send all queued events in close", Some(&e));
        false
    }
}

fn build_locator(config: &AppenderConfig, clock: Arc<dyn Clock>) -> Result<TargetLocator, ConfigError> {
    if config.connection_string.trim().is_empty() {
        return Err(ConfigError::EmptyConnectionString);
    }
    let date_pattern = DatePattern::parse(&config.rolling_index_date_format)?;
    let descriptor = ConnectionDescriptor::parse(&config.effective_connection_string())?;
    TargetLocator::new(&descriptor, date_pattern, clock)
}

/// Settings only [`ElasticAppender::activate`] applies to the transport it builds.
fn transport_settings_set(config: &AppenderConfig) -> bool {
    !config.field_name_overrides.is_empty()
        || !config.field_value_replicas.is_empty()
        || config.accept_invalid_certs
        || config.request_timeout.is_some()
}

fn report(name: &str, error_handler: &dyn ErrorHandler, message: &str, err: &(dyn Error + 'static)) {
    let line = format!("{} [{}]: {}", crate::dispatch::COMPONENT, name, message);
    error_handler.error(&line, Some(err));
}
