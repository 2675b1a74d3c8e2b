use crate::appender::{ActivationError, AppenderConfig, ElasticAppender};
use crate::error_handler::TracingErrorHandler;
use crate::layer::{ElasticLayer, SinkHandle};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::Duration;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Configuration of the buffering layer.
///
/// **Fields**
/// - `channel_buffer`: maximum number of [`LogEvent`](crate::record::LogEvent)s
///   waiting in the queue before new ones are dropped.
/// - `flush_interval`: maximum time a partial buffer waits before it is
///   handed to the appender.
/// - `min_level`: least severe level that is shipped.
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt::Layer` is
///   installed next to the [`ElasticLayer`] so events also reach the console.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub channel_buffer: usize,
    pub flush_interval: Duration,
    pub min_level: Level,
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 1024,
            flush_interval: Duration::from_secs(1),
            min_level: Level::INFO,
            enable_stdout: true,
        }
    }
}

/// Errors from installing the global subscriber.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error("must be called from within a Tokio runtime")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("failed to install global subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Activate an [`ElasticAppender`] and install it as part of the global
/// `tracing` subscriber.
///
/// **Parameters**
/// - `appender`: connection string, buffer size and close timeout of the
///   appender.
/// - `config`: [`LayerConfig`] controlling queueing and console output.
///
/// **Returns**
/// - a [`SinkHandle`]; call [`SinkHandle::shutdown`] before the process
///   exits so buffered events are shipped.
pub fn init_tracing_with_config(appender: AppenderConfig, config: LayerConfig) -> Result<SinkHandle, InitError> {
    let runtime = Handle::try_current()?;
    let appender = ElasticAppender::activate(appender, runtime, Arc::new(TracingErrorHandler))?;
    init_tracing_with_appender(Arc::new(appender), config)
}

/// Install an already activated appender, e.g. one built with a custom
/// [`Transport`](crate::transport::Transport).
pub fn init_tracing_with_appender(appender: Arc<ElasticAppender>, config: LayerConfig) -> Result<SinkHandle, InitError> {
    Handle::try_current()?;
    let (layer, handle) = ElasticLayer::new(
        appender,
        config.channel_buffer,
        config.flush_interval,
        config.min_level,
    );

    // Subscriber types differ with and without the fmt layer.
    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(handle)
}

/// Initialize tracing with the default [`LayerConfig`].
pub fn init_tracing(appender: AppenderConfig) -> Result<SinkHandle, InitError> {
    init_tracing_with_config(appender, LayerConfig::default())
}
