//! Latest known vehicle position

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::types::TelemetryRecord;

/// Holds the most recent position from either transport path
///
/// Last write wins: there is no ordering guarantee between the direct JSON
/// feed and the satellite relay. Clones share the same value.
#[derive(Debug, Clone)]
pub struct PositionBoard {
    latest: Arc<watch::Sender<Option<Arc<TelemetryRecord>>>>,
}

impl PositionBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { latest: Arc::new(tx) }
    }

    /// Replace the latest position
    pub fn publish(&self, record: TelemetryRecord) {
        debug!(
            system_id = record.system_id,
            latitude = record.latitude,
            longitude = record.longitude,
            "Position updated"
        );
        // send_replace succeeds even when nobody is subscribed
        self.latest.send_replace(Some(Arc::new(record)));
    }

    /// Latest position, if any has been received
    pub fn latest(&self) -> Option<Arc<TelemetryRecord>> {
        self.latest.borrow().clone()
    }

    /// Stream of positions: the current one (if any), then every update
    pub fn updates(&self) -> impl Stream<Item = Arc<TelemetryRecord>> + 'static {
        WatchStream::new(self.latest.subscribe()).filter_map(|opt| async move { opt })
    }
}

impl Default for PositionBoard {
    fn default() -> Self {
        Self::new()
    }
}
