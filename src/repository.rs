use crate::locator::{ResolvedTarget, TargetLocator, WriteMode};
use crate::record::LogEvent;
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use std::sync::Arc;

/// Destination for a flushed batch, as seen by the dispatch coordinator.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Write the whole batch. Stops at the first failure.
    async fn add(&self, events: &[LogEvent]) -> Result<(), TransportError>;

    /// Short name used in error reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("EventRepository")
    }
}

/// Picks the single-document or bulk path for every flush.
pub struct ShippingRepository {
    locator: TargetLocator,
    transport: Arc<dyn Transport>,
}

impl ShippingRepository {
    pub fn new(locator: TargetLocator, transport: Arc<dyn Transport>) -> Self {
        ShippingRepository { locator, transport }
    }

    pub fn locator(&self) -> &TargetLocator {
        &self.locator
    }

    /// Ship `events` to an already resolved target.
    ///
    /// In [`WriteMode::Single`] events are posted one by one in order and
    /// the first failure aborts the rest of the batch. In
    /// [`WriteMode::Bulk`] the whole batch goes out as one request.
    pub async fn send(&self, target: &ResolvedTarget, events: &[LogEvent]) -> Result<(), TransportError> {
        if events.is_empty() {
            return Ok(());
        }
        match target.mode {
            WriteMode::Single => {
                for event in events {
                    self.transport.send_one(target, event).await?;
                }
                Ok(())
            }
            WriteMode::Bulk => self.transport.send_bulk(target, events).await,
        }
    }
}

#[async_trait]
impl EventRepository for ShippingRepository {
    async fn add(&self, events: &[LogEvent]) -> Result<(), TransportError> {
        let target = self.locator.resolve();
        self.send(&target, events).await
    }
}
