//! Telemetry ingestion: relay payload decoding, device attribution and the
//! latest-position board.

mod codec;
mod ingest;
mod position;
mod registry;

pub use codec::{FULL_PAYLOAD_LEN, MIN_PAYLOAD_LEN, decode};
pub use ingest::TelemetryIngest;
pub use position::PositionBoard;
pub use registry::DeviceRegistry;
