use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::error;

use tracing_elastic_sink::error_handler::TracingErrorHandler;
use tracing_elastic_sink::init::{init_tracing_with_appender, LayerConfig};
use tracing_elastic_sink::locator::SystemClock;
use tracing_elastic_sink::noop_transport::NoopTransport;
use tracing_elastic_sink::{AppenderConfig, ElasticAppender};

#[tokio::main]
async fn main() {
    let config = AppenderConfig::new("load", "Server=localhost;Index=load");
    let appender = ElasticAppender::activate_with(
        config,
        Handle::current(),
        Arc::new(TracingErrorHandler),
        Arc::new(NoopTransport),
        Arc::new(SystemClock),
    )
    .expect("valid config");

    let layer_config = LayerConfig {
        enable_stdout: false,
        ..LayerConfig::default()
    };
    let handle = init_tracing_with_appender(Arc::new(appender), layer_config).expect("install subscriber");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(target: "load", iteration = i, "default load test error");
    }

    let elapsed = start.elapsed();
    println!("default config: logged {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    let drained = handle.shutdown().await;
    println!("drained: {}", drained);
}
