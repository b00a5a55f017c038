//! Measurement Protocol
//!
//! Decoders turning raw notification payloads into named fields. The
//! registry asks each decoder in registration order and falls back to an
//! "Unknown" result, so decoding never fails.

use crate::domain::models::{DecodedMeasurement, RawMeasurement};
use crate::domain::settings::Settings;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::{debug, trace};
use uuid::Uuid;

/// Placeholder Motion service UUID, overridable in settings
pub const MOTION_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0001);

/// Placeholder Motion characteristic UUID, overridable in settings
pub const MOTION_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0002);

/// Minimum Motion payload length: four little-endian f32 values
pub const MOTION_PACKET_LEN: usize = 16;

pub const UNKNOWN_NAME: &str = "Unknown";

/// Uppercase hex dump of a payload, no separators
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Bounds-checked little-endian f32 read
pub fn read_f32_le(bytes: &[u8], offset: usize) -> Option<f32> {
    let end = offset.checked_add(4)?;
    let chunk: [u8; 4] = bytes.get(offset..end)?.try_into().ok()?;
    Some(f32::from_le_bytes(chunk))
}

/// Parse a UUID string from the settings file
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim()).with_context(|| format!("Invalid UUID: {}", uuid_str))
}

pub trait MeasurementDecoder: Send + Sync {
    fn name(&self) -> &str;

    /// Fields for `measurement`, or `None` when this decoder does not apply
    fn decode(&self, measurement: &RawMeasurement) -> Option<BTreeMap<String, String>>;
}

/// Swing metrics packet
///
/// ```text
/// [0-3]   : SpeedMps (f32 LE)
/// [4-7]   : FaceAngleDeg (f32 LE)
/// [8-11]  : PathDeg (f32 LE)
/// [12-15] : Tempo (f32 LE)
/// ```
///
/// Trailing bytes are ignored.
pub struct MotionDecoder {
    service_id: Uuid,
    characteristic_id: Uuid,
}

impl MotionDecoder {
    const FIELDS: [&'static str; 4] = ["SpeedMps", "FaceAngleDeg", "PathDeg", "Tempo"];

    pub fn new(service_id: Uuid, characteristic_id: Uuid) -> Self {
        Self {
            service_id,
            characteristic_id,
        }
    }
}

impl Default for MotionDecoder {
    fn default() -> Self {
        Self::new(MOTION_SERVICE_UUID, MOTION_CHARACTERISTIC_UUID)
    }
}

impl MeasurementDecoder for MotionDecoder {
    fn name(&self) -> &str {
        "Motion"
    }

    fn decode(&self, measurement: &RawMeasurement) -> Option<BTreeMap<String, String>> {
        if measurement.service_id != self.service_id
            || measurement.characteristic_id != self.characteristic_id
        {
            return None;
        }
        if measurement.payload.len() < MOTION_PACKET_LEN {
            debug!(
                "Motion payload too short: {} bytes (expected {})",
                measurement.payload.len(),
                MOTION_PACKET_LEN
            );
            return None;
        }

        Self::FIELDS
            .iter()
            .enumerate()
            .map(|(i, field)| {
                read_f32_le(&measurement.payload, i * 4)
                    .map(|value| (field.to_string(), format!("{:.2}", value)))
            })
            .collect()
    }
}

pub struct ProtocolRegistry {
    decoders: Vec<Box<dyn MeasurementDecoder>>,
}

impl ProtocolRegistry {
    /// Registry without any decoder
    pub fn empty() -> Self {
        Self {
            decoders: Vec::new(),
        }
    }

    /// Registry with the built-in Motion decoder on the configured ids
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let service_id = parse_uuid(&settings.motion_service_uuid)?;
        let characteristic_id = parse_uuid(&settings.motion_characteristic_uuid)?;
        let mut registry = Self::empty();
        registry.register(MotionDecoder::new(service_id, characteristic_id));
        Ok(registry)
    }

    /// Append a decoder; earlier registrations take precedence
    pub fn register(&mut self, decoder: impl MeasurementDecoder + 'static) {
        self.decoders.push(Box::new(decoder));
    }

    pub fn decode(&self, measurement: &RawMeasurement) -> DecodedMeasurement {
        let raw_hex = to_hex(&measurement.payload);
        trace!(
            "Decoding {} bytes from {}: {}",
            measurement.payload.len(),
            measurement.characteristic_id,
            raw_hex
        );

        let (name, fields) = self
            .decoders
            .iter()
            .find_map(|decoder| {
                decoder
                    .decode(measurement)
                    .map(|fields| (decoder.name().to_string(), fields))
            })
            .unwrap_or_else(|| {
                let mut fields = BTreeMap::new();
                fields.insert("Info".to_string(), "Unrecognised characteristic".to_string());
                (UNKNOWN_NAME.to_string(), fields)
            });

        DecodedMeasurement {
            timestamp: measurement.timestamp,
            service_id: measurement.service_id,
            characteristic_id: measurement.characteristic_id,
            name,
            fields,
            raw_hex,
        }
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(MotionDecoder::default());
        registry
    }
}
