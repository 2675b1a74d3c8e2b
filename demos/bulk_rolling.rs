use tracing::{error, info};
use tracing_elastic_sink::env::{env_or, ELASTIC_SINK_CONNECTION_STRING_ENV};
use tracing_elastic_sink::init::init_tracing;
use tracing_elastic_sink::AppenderConfig;

#[tokio::main]
async fn main() {
    // Example: ELASTIC_SINK_CONNECTION_STRING="Server=localhost;Port=9200;Index=logs;Rolling=true"
    let mut config = AppenderConfig::from_env().expect("invalid ELASTIC_SINK_* variables");
    config.connection_string = env_or(
        ELASTIC_SINK_CONNECTION_STRING_ENV,
        "Server=localhost;Port=9200;Index=logs;Rolling=true",
    );

    let handle = init_tracing(config).expect("failed to install elastic sink");

    info!(target: "demo", "bulk rolling example started");
    error!(target: "demo", index = "logs", "simulated error sent via _bulk");

    if !handle.shutdown().await {
        eprintln!("some log events were still in flight at shutdown");
    }
}
