//! Satellite relay payload decoding
//!
//! The modem forwards a fixed-layout binary record as a hex string. Multi-byte
//! integers are little-endian and every field lives at a fixed byte offset:
//!
//! | Offset | Type | Field       | Scale            |
//! |--------|------|-------------|------------------|
//! | 10     | i32  | latitude    | × 1e-7 degrees   |
//! | 14     | i32  | longitude   | × 1e-7 degrees   |
//! | 32     | u8   | heading     | × 2, mod 360     |
//! | 35     | u8   | airspeed    | ÷ 5              |
//! | 37     | u8   | groundspeed | ÷ 5              |
//! | 38     | u8   | windspeed   | ÷ 5              |
//!
//! Only the position block (the first 18 bytes) is mandatory. Kinematic bytes
//! past the end of a shorter record read as zero.

use crate::error::DecodeError;
use crate::types::TelemetryRecord;
use tracing::trace;

/// Minimum payload length in bytes (position block)
pub const MIN_PAYLOAD_LEN: usize = 18;

/// Length of a record carrying every kinematic field
pub const FULL_PAYLOAD_LEN: usize = 39;

const LATITUDE_OFFSET: usize = 10;
const LONGITUDE_OFFSET: usize = 14;
const HEADING_OFFSET: usize = 32;
const AIRSPEED_OFFSET: usize = 35;
const GROUNDSPEED_OFFSET: usize = 37;
const WINDSPEED_OFFSET: usize = 38;

const COORDINATE_SCALE: f64 = 1e-7;
const SPEED_DIVISOR: f64 = 5.0;

/// Decode a hex-encoded relay payload into a [`TelemetryRecord`]
///
/// The returned record has `system_id == 0`; attributing it to a vehicle is
/// the caller's job (see [`crate::TelemetryIngest`]).
///
/// # Errors
///
/// - [`DecodeError::TooShort`] when the payload holds fewer than 18 bytes
/// - [`DecodeError::InvalidHex`] when a character is not a hex digit or the
///   digit count is odd
///
/// # Example
///
/// ```rust
/// use skyrelay::telemetry::decode;
///
/// let mut bytes = [0u8; 39];
/// bytes[10..14].copy_from_slice(&488_566_000i32.to_le_bytes());
/// bytes[14..18].copy_from_slice(&23_522_000i32.to_le_bytes());
/// bytes[32] = 45; // 90 degrees
/// let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
///
/// let record = decode(&hex).unwrap();
/// assert!((record.latitude - 48.8566).abs() < 1e-9);
/// assert_eq!(record.heading, 90.0);
/// ```
pub fn decode(payload: &str) -> Result<TelemetryRecord, DecodeError> {
    let payload = payload.trim();

    // Length is checked before content so truncated payloads are always TooShort
    let len = payload.len() / 2;
    if len < MIN_PAYLOAD_LEN {
        return Err(DecodeError::TooShort { len, required: MIN_PAYLOAD_LEN });
    }

    let bytes = decode_hex(payload)?;
    trace!(len = bytes.len(), "Decoding relay payload");

    Ok(TelemetryRecord {
        latitude: read_i32_le(&bytes, LATITUDE_OFFSET) as f64 * COORDINATE_SCALE,
        longitude: read_i32_le(&bytes, LONGITUDE_OFFSET) as f64 * COORDINATE_SCALE,
        heading: ((read_u8(&bytes, HEADING_OFFSET) as u16 * 2) % 360) as f64,
        airspeed: read_u8(&bytes, AIRSPEED_OFFSET) as f64 / SPEED_DIVISOR,
        groundspeed: read_u8(&bytes, GROUNDSPEED_OFFSET) as f64 / SPEED_DIVISOR,
        windspeed: read_u8(&bytes, WINDSPEED_OFFSET) as f64 / SPEED_DIVISOR,
        system_id: 0,
    })
}

fn decode_hex(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let digits = payload.as_bytes();
    if digits.len() % 2 != 0 {
        return Err(DecodeError::InvalidHex { position: digits.len() - 1 });
    }

    let mut bytes = Vec::with_capacity(digits.len() / 2);
    for (i, pair) in digits.chunks_exact(2).enumerate() {
        let high = hex_value(pair[0]).ok_or(DecodeError::InvalidHex { position: i * 2 })?;
        let low = hex_value(pair[1]).ok_or(DecodeError::InvalidHex { position: i * 2 + 1 })?;
        bytes.push((high << 4) | low);
    }

    Ok(bytes)
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|v| v as u8)
}

// Callers guarantee the position block is present
fn read_i32_le(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn read_u8(bytes: &[u8], offset: usize) -> u8 {
    bytes.get(offset).copied().unwrap_or(0)
}
