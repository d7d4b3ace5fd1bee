//! Entry points for the two telemetry transport paths

use tracing::{info, warn};

use super::{DeviceRegistry, PositionBoard, decode};
use crate::error::DecodeError;
use crate::relay_log::RelayLog;
use crate::types::TelemetryRecord;

/// Decodes relay payloads, attributes them to a vehicle and publishes them
#[derive(Debug, Clone)]
pub struct TelemetryIngest {
    registry: DeviceRegistry,
    board: PositionBoard,
    log: RelayLog,
}

impl TelemetryIngest {
    pub fn new(registry: DeviceRegistry, board: PositionBoard, log: RelayLog) -> Self {
        Self { registry, board, log }
    }

    /// Decode a payload and stamp it with the device's system id
    ///
    /// Pure apart from tracing; nothing is published.
    pub fn decode_telemetry(
        &self,
        hex_payload: &str,
        device_id: Option<&str>,
    ) -> Result<TelemetryRecord, DecodeError> {
        let record = decode(hex_payload)?;
        Ok(record.with_system_id(self.registry.lookup(device_id)))
    }

    /// Handle a satellite relay message
    ///
    /// On success the record becomes the latest position. On failure nothing
    /// is published and the caller should reject the request.
    pub fn ingest_relay(
        &self,
        hex_payload: &str,
        device_id: Option<&str>,
    ) -> Result<TelemetryRecord, DecodeError> {
        match self.decode_telemetry(hex_payload, device_id) {
            Ok(record) => {
                info!(
                    device = device_id.unwrap_or("<none>"),
                    system_id = record.system_id,
                    "Relay telemetry decoded"
                );
                self.log.append(format!(
                    "relay {} -> sysid {}: lat {:.7} lon {:.7} hdg {} as {} gs {} ws {}",
                    device_id.unwrap_or("<none>"),
                    record.system_id,
                    record.latitude,
                    record.longitude,
                    record.heading,
                    record.airspeed,
                    record.groundspeed,
                    record.windspeed,
                ));
                self.board.publish(record);
                Ok(record)
            }
            Err(e) => {
                warn!(device = device_id.unwrap_or("<none>"), error = %e, "Rejected relay payload");
                self.log.append(format!("relay {} rejected: {}", device_id.unwrap_or("<none>"), e));
                Err(e)
            }
        }
    }

    /// Handle a position from the direct JSON feed
    pub fn ingest_position(&self, record: TelemetryRecord) {
        self.board.publish(record);
    }

    pub fn board(&self) -> &PositionBoard {
        &self.board
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn log(&self) -> &RelayLog {
        &self.log
    }
}
