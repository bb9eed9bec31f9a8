use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::event::{TelemetryEvent, TelemetryValue};
use crate::sinks::warehouse::{WarehouseRow, WarehouseWriter};
use crate::sinks::{BlobWriter, Sink};

/// Routes admitted events to durable storage by type.
///
/// Metric and status events become one warehouse row each. Image events are
/// written to object storage under a deterministic key, then recorded in the
/// warehouse as a pointer row. Both steps are idempotent, so retrying after
/// a partial failure re-runs the whole route safely.
pub struct PersistenceRouter {
    warehouse: Arc<dyn WarehouseWriter>,
    blobs: Arc<dyn BlobWriter>,
    storage_prefix: String,
}

impl PersistenceRouter {
    pub fn new(
        warehouse: Arc<dyn WarehouseWriter>,
        blobs: Arc<dyn BlobWriter>,
        storage_prefix: String,
    ) -> Self {
        Self {
            warehouse,
            blobs,
            storage_prefix,
        }
    }

    fn row_for(&self, event: &TelemetryEvent) -> WarehouseRow {
        let (reading, status_code, blob_ref) = match &event.value {
            TelemetryValue::Reading(v) => (Some(*v), None, None),
            TelemetryValue::StatusCode(c) => (None, Some(*c), None),
            TelemetryValue::Blob(_) => (None, None, Some(event.storage_key(&self.storage_prefix))),
        };
        WarehouseRow {
            device_id: event.device_id.clone(),
            event_type: event.event_type.as_str().to_string(),
            occurred_at: event.timestamp,
            reading,
            status_code,
            blob_ref,
            device_seq: event.sequence.map(|s| s as i64),
        }
    }
}

#[async_trait]
impl Sink for PersistenceRouter {
    fn name(&self) -> &'static str {
        "persistence"
    }

    async fn deliver(&self, event: &TelemetryEvent) -> Result<(), SinkError> {
        // Blob first: the pointer row must never reference an object that
        // was not written.
        if let TelemetryValue::Blob(bytes) = &event.value {
            let key = event.storage_key(&self.storage_prefix);
            self.blobs.put_blob(&key, bytes.clone()).await?;
        }
        self.warehouse.write_row(&self.row_for(event)).await
    }
}
