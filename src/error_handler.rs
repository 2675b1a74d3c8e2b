use std::error::Error;
use std::sync::Mutex;

/// Receives failures the sink cannot surface to its caller.
///
/// Implementations must not panic; they are called from background send
/// tasks and from the shutdown path.
pub trait ErrorHandler: Send + Sync {
    fn error(&self, message: &str, source: Option<&(dyn Error + 'static)>);
}

/// Reports through `tracing` at `error` level.
///
/// The events carry this crate's target, which the shipping layer skips,
/// so reports reach the console or other layers but are never shipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn error(&self, message: &str, source: Option<&(dyn Error + 'static)>) {
        match source {
            Some(source) => tracing::error!(error = %source, "{}", message),
            None => tracing::error!("{}", message),
        }
    }
}

/// Keeps every report in memory. Useful in tests and health checks.
#[derive(Debug, Default)]
pub struct CollectingErrorHandler {
    reports: Mutex<Vec<String>>,
}

impl CollectingErrorHandler {
    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ErrorHandler for CollectingErrorHandler {
    fn error(&self, message: &str, source: Option<&(dyn Error + 'static)>) {
        let line = match source {
            Some(source) => format!("{} ({})", message, source),
            None => message.to_string(),
        };
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(line);
        }
    }
}
