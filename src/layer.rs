use crate::appender::ElasticAppender;
use crate::record::LogEvent;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Events from these crates and their modules are never shipped: this crate's own
/// diagnostics and the HTTP stack underneath it would feed back into the
/// sink.
const SKIPPED_TARGETS: &[&str] = &[env!("CARGO_CRATE_NAME"), "reqwest", "hyper", "h2", "rustls"];

enum Message {
    Event(LogEvent),
    Shutdown(oneshot::Sender<()>),
}

/// `tracing_subscriber` layer that turns events into [`LogEvent`]s and
/// buffers them for an [`ElasticAppender`].
///
/// Events at or above `min_level` are pushed into a bounded channel. A
/// background task collects them into buffers of the appender's
/// `buffer_size` and hands each full buffer to
/// [`ElasticAppender::send_buffer`]; partial buffers are handed over every
/// `flush_interval`. The application thread never waits on I/O.
pub struct ElasticLayer {
    sender: mpsc::Sender<Message>,
    min_level: Level,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Successfully enqueued into channel.
    pub enqueued_events: Arc<AtomicU64>,
    /// Dropped because the channel was full or closed.
    pub dropped_events: Arc<AtomicU64>,
}

/// Owner side of an [`ElasticLayer`], used to shut the pipeline down.
pub struct SinkHandle {
    sender: mpsc::Sender<Message>,
    appender: Arc<ElasticAppender>,
    task: JoinHandle<()>,
}

impl SinkHandle {
    pub fn appender(&self) -> &Arc<ElasticAppender> {
        &self.appender
    }

    /// Hand over the partial buffer, then wait for in-flight sends.
    ///
    /// **Returns**
    /// - `true` if all sends finished within the appender's
    ///   `on_close_timeout`.
    pub async fn shutdown(self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.sender.send(Message::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
        let _ = self.task.await;
        self.appender.close().await
    }
}

impl ElasticLayer {
    /// Create a new layer and spawn the buffering task on the current
    /// Tokio runtime.
    ///
    /// Minimal thresholds are enforced for `channel_buffer` and
    /// `flush_interval` to avoid degenerate configurations.
    pub fn new(
        appender: Arc<ElasticAppender>,
        channel_buffer: usize,
        flush_interval: Duration,
        min_level: Level,
    ) -> (Self, SinkHandle) {
        let channel_buffer = channel_buffer.max(16);
        let flush_interval = flush_interval.max(Duration::from_millis(10));
        let batch_size = appender.config().buffer_size.max(1);

        let (tx, mut rx) = mpsc::channel::<Message>(channel_buffer);

        let total_events = Arc::new(AtomicU64::new(0));
        let enqueued_events = Arc::new(AtomicU64::new(0));
        let dropped_events = Arc::new(AtomicU64::new(0));

        let appender_bg = Arc::clone(&appender);
        let task = tokio::spawn(async move {
            let mut batch: Vec<LogEvent> = Vec::with_capacity(batch_size.min(4096));
            let mut ticker = interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(Message::Event(event)) => {
                            batch.push(event);
                            if batch.len() >= batch_size {
                                appender_bg.send_buffer(std::mem::take(&mut batch));
                            }
                        }
                        Some(Message::Shutdown(done)) => {
                            appender_bg.send_buffer(std::mem::take(&mut batch));
                            let _ = done.send(());
                            break;
                        }
                        None => {
                            appender_bg.send_buffer(std::mem::take(&mut batch));
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if !batch.is_empty() {
                            appender_bg.send_buffer(std::mem::take(&mut batch));
                        }
                    }
                }
            }
        });

        let handle = SinkHandle {
            sender: tx.clone(),
            appender,
            task,
        };

        (
            Self {
                sender: tx,
                min_level,
                total_events,
                enqueued_events,
                dropped_events,
            },
            handle,
        )
    }

    fn is_skipped(target: &str) -> bool {
        SKIPPED_TARGETS.iter().any(|krate| {
            target
                .strip_prefix(krate)
                .map_or(false, |rest| rest.is_empty() || rest.starts_with("::"))
        })
    }
}

impl<S> Layer<S> for ElasticLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let meta = event.metadata();
        if *meta.level() > self.min_level || Self::is_skipped(meta.target()) {
            return;
        }

        let mut properties = BTreeMap::new();
        let mut message: Option<String> = None;

        let mut visitor = FieldVisitor { fields: &mut properties, message: &mut message };
        event.record(&mut visitor);

        let record = LogEvent {
            timestamp: Utc::now(),
            level: meta.level().to_string(),
            logger_name: meta.target().to_string(),
            message,
            module_path: meta.module_path().map(|s| s.to_string()),
            file: meta.file().map(|s| s.to_string()),
            line: meta.line(),
            properties,
        };

        match self.sender.try_send(Message::Event(record)) {
            Ok(()) => {
                self.enqueued_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

use tracing::field::{Field, Visit};

pub struct FieldVisitor<'a> {
    pub fields: &'a mut BTreeMap<String, serde_json::Value>,
    pub message: &'a mut Option<String>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.fields.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(format!("{:?}", value)));
        }
    }
}
