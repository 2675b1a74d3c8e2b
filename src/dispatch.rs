use crate::error_handler::ErrorHandler;
use crate::record::LogEvent;
use crate::repository::EventRepository;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

/// Component name used as prefix of every error report.
pub const COMPONENT: &str = "ElasticAppender";

/// Sends still running when the drain window closed. They keep running
/// detached; nobody waits for them again.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{pending} send(s) still in flight after {timeout:?}")]
pub struct DrainTimeout {
    pub pending: usize,
    pub timeout: Duration,
}

/// Number of in-flight sends paired with an all-clear signal.
///
/// The signal is `false` whenever the count is above zero. Both the counter
/// update and the signal update run under the watch channel's lock, so an
/// increment can never be overtaken by a stale all-clear from a concurrent
/// decrement to zero.
#[derive(Debug)]
pub struct InFlight {
    count: AtomicUsize,
    all_clear: watch::Sender<bool>,
}

impl Default for InFlight {
    fn default() -> Self {
        InFlight::new()
    }
}

impl InFlight {
    pub fn new() -> Self {
        let (all_clear, _) = watch::channel(true);
        InFlight {
            count: AtomicUsize::new(0),
            all_clear,
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_clear(&self) -> bool {
        *self.all_clear.borrow()
    }

    fn begin(&self) {
        self.all_clear.send_modify(|clear| {
            self.count.fetch_add(1, Ordering::AcqRel);
            *clear = false;
        });
    }

    fn finish(&self) {
        self.all_clear.send_if_modified(|clear| {
            if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
                *clear = true;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the count reaches zero or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.all_clear.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|clear| *clear))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }
}

/// Registered on flush, released when the send task ends, even by panic.
struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn begin(in_flight: Arc<InFlight>) -> Self {
        in_flight.begin();
        InFlightGuard(in_flight)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Reports a batch whose send task was dropped before it ran, which is
/// what `Handle::spawn` does once the runtime has shut down.
struct UnsentBatch {
    error_handler: Arc<dyn ErrorHandler>,
    name: Arc<str>,
    count: usize,
    armed: bool,
}

impl UnsentBatch {
    fn started(mut self) {
        self.armed = false;
    }
}

impl Drop for UnsentBatch {
    fn drop(&mut self) {
        if self.armed {
            let line = format!(
                "{} [{}]: Failed to async send {} log events in flush.",
                COMPONENT, self.name, self.count
            );
            self.error_handler.error(&line, None);
        }
    }
}

/// Hands flushed batches to background tasks and tracks them until they end.
///
/// [`flush`](Self::flush) never blocks and never reports the outcome of a
/// send to its caller; failures go to the [`ErrorHandler`]. At shutdown,
/// [`drain`](Self::drain) waits a bounded time for outstanding sends.
/// Flushes are accepted after a drain as well.
pub struct DispatchCoordinator {
    repository: Arc<dyn EventRepository>,
    error_handler: Arc<dyn ErrorHandler>,
    in_flight: Arc<InFlight>,
    name: Arc<str>,
    runtime: Handle,
}

impl DispatchCoordinator {
    /// **Parameters**
    /// - `repository`: where batches are written.
    /// - `error_handler`: receives send failures.
    /// - `name`: appender instance name used in error reports.
    /// - `runtime`: Tokio runtime the send tasks are spawned on.
    pub fn new(
        repository: Arc<dyn EventRepository>,
        error_handler: Arc<dyn ErrorHandler>,
        name: impl Into<String>,
        runtime: Handle,
    ) -> Self {
        DispatchCoordinator {
            repository,
            error_handler,
            in_flight: Arc::new(InFlight::new()),
            name: Arc::from(name.into()),
            runtime,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_clear()
    }

    /// Format a report line as `Component [name]: message.`
    pub fn report(&self, message: &str, source: Option<&(dyn std::error::Error + 'static)>) {
        let line = format!("{} [{}]: {}.", COMPONENT, self.name, message);
        self.error_handler.error(&line, source);
    }

    /// Schedule an asynchronous send of `events` and return immediately.
    ///
    /// The in-flight count is raised before the task is spawned. An empty
    /// batch is ignored. A batch whose task never runs, because the runtime
    /// is gone, is reported to the error handler.
    pub fn flush(&self, events: Vec<LogEvent>) {
        if events.is_empty() {
            return;
        }

        let guard = InFlightGuard::begin(Arc::clone(&self.in_flight));
        let repository = Arc::clone(&self.repository);
        let error_handler = Arc::clone(&self.error_handler);
        let name = Arc::clone(&self.name);
        let count = events.len();
        let unsent = UnsentBatch {
            error_handler: Arc::clone(&error_handler),
            name: Arc::clone(&name),
            count,
            armed: true,
        };

        self.runtime.spawn(async move {
            unsent.started();
            let _guard = guard;
            match repository.add(&events).await {
                Ok(()) => debug!(count, "log batch shipped"),
                Err(e) => {
                    let line = format!(
                        "{} [{}]: Failed to add {} log events to {} in flush.",
                        COMPONENT,
                        name,
                        count,
                        repository.name()
                    );
                    error_handler.error(&line, Some(&e));
                }
            }
        });
    }

    /// Wait until every in-flight send has finished, at most `timeout`.
    ///
    /// **Returns**
    /// - `true` if the all-clear signal was raised in time.
    /// - `false` on timeout; running sends are left untouched.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.in_flight.wait(timeout).await
    }

    /// Blocking variant of [`drain`](Self::drain) for synchronous shutdown
    /// paths. Must not be called from inside the runtime's async context.
    pub fn drain_blocking(&self, timeout: Duration) -> bool {
        self.runtime.block_on(self.drain(timeout))
    }

    /// Drain and turn a timeout into a [`DrainTimeout`] error.
    pub async fn close(&self, timeout: Duration) -> Result<(), DrainTimeout> {
        if self.drain(timeout).await {
            Ok(())
        } else {
            Err(DrainTimeout {
                pending: self.in_flight(),
                timeout,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handler::CollectingErrorHandler;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    /// Repository whose sends block until permits are released.
    struct GatedRepository {
        gate: Semaphore,
        added: AtomicUsize,
        fail: bool,
        panic: bool,
    }

    impl Default for GatedRepository {
        fn default() -> Self {
            GatedRepository {
                gate: Semaphore::new(0),
                added: AtomicUsize::new(0),
                fail: false,
                panic: false,
            }
        }
    }

    impl GatedRepository {
        fn open() -> Self {
            let repo = GatedRepository::default();
            repo.gate.add_permits(Semaphore::MAX_PERMITS / 2);
            repo
        }
    }

    #[async_trait]
    impl EventRepository for GatedRepository {
        async fn add(&self, events: &[LogEvent]) -> Result<(), TransportError> {
            self.gate.acquire().await.expect("gate closed").forget();
            if self.panic {
                panic!("repository exploded");
            }
            self.added.fetch_add(events.len(), Ordering::SeqCst);
            if self.fail {
                return Err(TransportError::Status {
                    status: 503,
                    url: "http://es/app/_bulk".into(),
                    body: String::new(),
                });
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "GatedRepository"
        }
    }

    fn coordinator(repo: Arc<GatedRepository>, handler: Arc<CollectingErrorHandler>) -> DispatchCoordinator {
        DispatchCoordinator::new(repo, handler, "es-main", Handle::current())
    }

    fn batch(n: usize) -> Vec<LogEvent> {
        (0..n).map(|i| LogEvent::new("INFO", "app", format!("e{}", i))).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn starts_idle() {
        let c = coordinator(Arc::new(GatedRepository::open()), Arc::default());
        assert!(c.is_idle());
        assert_eq!(c.in_flight(), 0);
        assert!(c.drain(Duration::ZERO).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_returns_before_send_completes() {
        let repo = Arc::new(GatedRepository::default());
        let c = coordinator(repo.clone(), Arc::default());

        c.flush(batch(3));
        assert_eq!(c.in_flight(), 1);
        assert!(!c.is_idle());

        assert!(!c.drain(Duration::from_millis(50)).await);
        assert_eq!(c.in_flight(), 1);

        repo.gate.add_permits(1);
        assert!(c.drain(Duration::from_secs(5)).await);
        assert_eq!(c.in_flight(), 0);
        assert!(c.is_idle());
        assert_eq!(repo.added.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_flushes_return_to_zero() {
        let repo = Arc::new(GatedRepository::open());
        let c = Arc::new(coordinator(repo.clone(), Arc::default()));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        c.flush(batch(2));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(c.drain(Duration::from_secs(10)).await);
        assert_eq!(c.in_flight(), 0);
        assert!(c.is_idle());
        assert_eq!(repo.added.load(Ordering::SeqCst), 8 * 50 * 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_go_to_error_handler() {
        let repo = Arc::new(GatedRepository {
            fail: true,
            ..GatedRepository::open()
        });
        let handler = Arc::new(CollectingErrorHandler::default());
        let c = coordinator(repo, handler.clone());

        c.flush(batch(4));
        assert!(c.drain(Duration::from_secs(5)).await);

        let reports = handler.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].starts_with(
            "ElasticAppender [es-main]: Failed to add 4 log events to GatedRepository in flush."
        ));
        assert!(reports[0].contains("503"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_send_still_releases_slot() {
        let repo = Arc::new(GatedRepository {
            panic: true,
            ..GatedRepository::open()
        });
        let c = coordinator(repo, Arc::default());

        c.flush(batch(1));
        assert!(c.drain(Duration::from_secs(5)).await);
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_drain_leaves_sends_running() {
        let repo = Arc::new(GatedRepository::default());
        let c = coordinator(repo.clone(), Arc::default());

        c.flush(batch(1));
        c.flush(batch(1));
        let err = c.close(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.pending, 2);

        repo.gate.add_permits(2);
        assert!(c.drain(Duration::from_secs(5)).await);
        assert_eq!(repo.added.load(Ordering::SeqCst), 2);
    }

    // Assumed contract: the coordinator has no terminal state, so a flush
    // after a completed drain is still shipped.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_after_drain_is_accepted() {
        let repo = Arc::new(GatedRepository::open());
        let c = coordinator(repo.clone(), Arc::default());

        assert!(c.drain(Duration::from_millis(10)).await);
        c.flush(batch(2));
        assert!(c.drain(Duration::from_secs(5)).await);
        assert_eq!(repo.added.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_flush_is_ignored() {
        let c = coordinator(Arc::new(GatedRepository::default()), Arc::default());
        c.flush(Vec::new());
        assert!(c.is_idle());
    }

    #[test]
    fn drain_blocking_from_sync_context() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let repo = Arc::new(GatedRepository::open());
        let c = DispatchCoordinator::new(
            repo.clone(),
            Arc::new(CollectingErrorHandler::default()),
            "sync",
            rt.handle().clone(),
        );

        c.flush(batch(5));
        assert!(c.drain_blocking(Duration::from_secs(5)));
        assert_eq!(repo.added.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn flush_after_runtime_shutdown_is_reported() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let repo = Arc::new(GatedRepository::open());
        let handler = Arc::new(CollectingErrorHandler::default());
        let c = DispatchCoordinator::new(repo.clone(), handler.clone(), "late", rt.handle().clone());
        drop(rt);

        c.flush(batch(3));

        assert_eq!(c.in_flight(), 0);
        assert!(c.is_idle());
        assert_eq!(repo.added.load(Ordering::SeqCst), 0);
        assert_eq!(
            handler.reports(),
            vec!["ElasticAppender [late]: Failed to async send 3 log events in flush.".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn started_send_is_not_reported_as_unsent() {
        let repo = Arc::new(GatedRepository::open());
        let handler = Arc::new(CollectingErrorHandler::default());
        let c = coordinator(repo, handler.clone());

        c.flush(batch(2));
        assert!(c.drain(Duration::from_secs(5)).await);
        assert!(handler.reports().is_empty());
    }
}
