use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::error;
use tracing_elastic_sink::error_handler::TracingErrorHandler;
use tracing_elastic_sink::init::{init_tracing_with_appender, LayerConfig};
use tracing_elastic_sink::locator::{ResolvedTarget, SystemClock};
use tracing_elastic_sink::{AppenderConfig, ElasticAppender, LogEvent, Transport, TransportError};

/// Example of plugging in a custom transport by implementing the
/// `Transport` trait directly. Here it just prints what would be sent.
struct StdoutTransport;

#[async_trait]
impl Transport for StdoutTransport {
    async fn send_one(&self, target: &ResolvedTarget, event: &LogEvent) -> Result<(), TransportError> {
        println!("[{}] {}", target, serde_json::to_string(event)?);
        Ok(())
    }

    async fn send_bulk(&self, target: &ResolvedTarget, events: &[LogEvent]) -> Result<(), TransportError> {
        println!("[{}] {} events", target, events.len());
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let mut config = AppenderConfig::new("stdout", "Server=localhost;Index=demo");
    config.buffer_size = 1;

    let appender = ElasticAppender::activate_with(
        config,
        Handle::current(),
        Arc::new(TracingErrorHandler),
        Arc::new(StdoutTransport),
        Arc::new(SystemClock),
    )
    .expect("valid config");
    let handle = init_tracing_with_appender(Arc::new(appender), LayerConfig::default()).expect("install subscriber");

    error!(target: "demo", db = "custom", "simulated error sent via custom transport");
    handle.shutdown().await;
}
