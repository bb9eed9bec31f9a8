use async_trait::async_trait;

use crate::error::SinkError;
use crate::event::TelemetryEvent;

pub mod event_bus;
pub mod object_store;
pub mod router;
pub mod warehouse;

pub use event_bus::EventBusSink;
pub use object_store::{BlobWriter, ObjectStoreSink};
pub use router::PersistenceRouter;
pub use warehouse::{WarehouseRow, WarehouseSink, WarehouseWriter};

/// One downstream destination for admitted events. A single attempt; the
/// bounded retry loop in [`crate::retry`] drives it to a receipt.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, event: &TelemetryEvent) -> Result<(), SinkError>;
}
