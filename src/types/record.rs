//! Decoded telemetry records

use serde::{Deserialize, Serialize};

/// One position and kinematics fix for a vehicle
///
/// Records are immutable once built. Each decode produces a fresh one and
/// consumers keep only the most recent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Heading in degrees, `[0, 360)`
    pub heading: f64,
    pub airspeed: f64,
    pub groundspeed: f64,
    pub windspeed: f64,
    /// Logical system id of the reporting vehicle (0 when unknown)
    #[serde(default)]
    pub system_id: u32,
}

impl TelemetryRecord {
    /// Return a copy attributed to `system_id`
    pub fn with_system_id(self, system_id: u32) -> Self {
        Self { system_id, ..self }
    }
}
