use crate::locator::ResolvedTarget;
use crate::record::LogEvent;
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;

/// A transport that accepts and drops every write.
///
/// Useful for measuring the overhead of buffering and dispatch without
/// any network I/O, and for tests that don't care about delivery.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn send_one(&self, _target: &ResolvedTarget, _event: &LogEvent) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_bulk(&self, _target: &ResolvedTarget, _events: &[LogEvent]) -> Result<(), TransportError> {
        Ok(())
    }
}
