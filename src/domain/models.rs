//! Domain Models
//!
//! Value types shared by the scanner, connector, subscription manager and
//! decoder registry.

use crate::domain::error::BleError;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// 48-bit Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    /// Largest value representable in 48 bits
    pub const MAX: u64 = 0xFFFF_FFFF_FFFF;

    pub fn new(raw: u64) -> Result<Self, BleError> {
        if raw > Self::MAX {
            return Err(BleError::InvalidAddress(format!(
                "{:#X} does not fit in 48 bits",
                raw
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]
        )
    }
}

/// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF`, `0xAABBCCDDEEFF`
/// and bare `AABBCCDDEEFF`.
impl FromStr for DeviceAddress {
    type Err = BleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let invalid = || BleError::InvalidAddress(input.to_string());

        let digits = if let Some(hex) = input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))
        {
            hex.to_string()
        } else if input.contains(':') || input.contains('-') {
            let octets: Vec<&str> = input.split(|c| c == ':' || c == '-').collect();
            if octets.len() != 6 || octets.iter().any(|o| o.len() != 2) {
                return Err(invalid());
            }
            octets.concat()
        } else {
            input.to_string()
        };

        if digits.is_empty()
            || digits.len() > 12
            || !digits.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(invalid());
        }
        let raw = u64::from_str_radix(&digits, 16).map_err(|_| invalid())?;
        Self::new(raw)
    }
}

/// Three-valued answer for platform state that may be unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriState {
    #[default]
    Unknown,
    True,
    False,
}

impl TriState {
    pub fn is_true(self) -> bool {
        self == TriState::True
    }

    pub fn is_known(self) -> bool {
        self != TriState::Unknown
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            TriState::True
        } else {
            TriState::False
        }
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        value.map(TriState::from).unwrap_or_default()
    }
}

impl fmt::Display for TriState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TriState::Unknown => "Unknown",
            TriState::True => "True",
            TriState::False => "False",
        };
        f.write_str(text)
    }
}

/// Link state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Disconnected,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a single pairing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    Paired,
    AlreadyPaired,
    NotReady,
    NotPaired,
    Failed,
    AccessDenied,
    ConnectionRejected,
    OperationInProgress,
    Rejected,
    Timeout,
    Canceled,
    Unsupported,
    Unknown,
}

impl PairingOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, PairingOutcome::Paired | PairingOutcome::AlreadyPaired)
    }
}

impl fmt::Display for PairingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Pairing protection level, tried in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionLevel {
    None,
    Encryption,
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of a received advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: DeviceAddress,
    pub name: String,
    pub signal_strength: i16,
}

impl DiscoveredDevice {
    pub fn new(address: DeviceAddress, name: impl Into<String>, signal_strength: i16) -> Self {
        let name = name.into();
        Self {
            address,
            name: if name.trim().is_empty() {
                "Unknown".to_string()
            } else {
                name
            },
            signal_strength,
        }
    }
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) RSSI: {} dBm",
            self.name, self.address, self.signal_strength
        )
    }
}

/// Outcome summary of one connect call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionDiagnostics {
    pub platform_id: Option<String>,
    pub initial_is_paired: TriState,
    pub initial_can_pair: TriState,
    pub final_is_paired: TriState,
    pub final_can_pair: TriState,
    pub pairing_attempted: bool,
    pub pairing_outcome: Option<PairingOutcome>,
    pub protection_level: Option<ProtectionLevel>,
    pub connection_status: ConnectionStatus,
    pub notes: Vec<String>,
}

/// Notification payload as captured from the platform
#[derive(Debug, Clone, PartialEq)]
pub struct RawMeasurement {
    pub timestamp: DateTime<Utc>,
    pub service_id: Uuid,
    pub characteristic_id: Uuid,
    pub payload: Arc<[u8]>,
}

impl RawMeasurement {
    pub fn new(
        timestamp: DateTime<Utc>,
        service_id: Uuid,
        characteristic_id: Uuid,
        payload: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            timestamp,
            service_id,
            characteristic_id,
            payload: payload.into(),
        }
    }
}

/// Named interpretation of a [`RawMeasurement`]
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMeasurement {
    pub timestamp: DateTime<Utc>,
    pub service_id: Uuid,
    pub characteristic_id: Uuid,
    pub name: String,
    pub fields: BTreeMap<String, String>,
    pub raw_hex: String,
}

impl DecodedMeasurement {
    /// Fields rendered as `key=value` pairs separated by spaces
    pub fn summary(&self) -> String {
        self.fields
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceDiscovered(DiscoveredDevice),
    MeasurementReceived(DecodedMeasurement),
    ConnectionStateChanged(bool),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_address() {
        let address: DeviceAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(address.as_u64(), 0xAABB_CCDD_EEFF);
        assert_eq!(address.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_parse_dash_and_hex_address() {
        let dashed: DeviceAddress = "01-02-03-04-05-06".parse().unwrap();
        let hex: DeviceAddress = "0x010203040506".parse().unwrap();
        assert_eq!(dashed, hex);
        assert_eq!(hex.to_string(), "01:02:03:04:05:06");
    }

    #[test]
    fn test_reject_bad_addresses() {
        assert!(matches!(
            "AA:BB:CC".parse::<DeviceAddress>(),
            Err(BleError::InvalidAddress(_))
        ));
        assert!(matches!(
            "0x1FFFFFFFFFFFF".parse::<DeviceAddress>(),
            Err(BleError::InvalidAddress(_))
        ));
        assert!("zz:bb:cc:dd:ee:ff".parse::<DeviceAddress>().is_err());
        assert!("+A:BB:CC:DD:EE:FF".parse::<DeviceAddress>().is_err());
        assert!("0x+ABBCCDDEEFF".parse::<DeviceAddress>().is_err());
        assert!("+ABBCCDDEEFF".parse::<DeviceAddress>().is_err());
        assert!(DeviceAddress::new(DeviceAddress::MAX + 1).is_err());
    }

    #[test]
    fn test_discovered_device_default_name() {
        let address = DeviceAddress::new(1).unwrap();
        assert_eq!(DiscoveredDevice::new(address, "  ", -40).name, "Unknown");
        assert_eq!(DiscoveredDevice::new(address, "Sensor", -40).name, "Sensor");
    }

    #[test]
    fn test_pairing_outcome_success() {
        assert!(PairingOutcome::Paired.is_success());
        assert!(PairingOutcome::AlreadyPaired.is_success());
        assert!(!PairingOutcome::Failed.is_success());
        assert!(!PairingOutcome::AccessDenied.is_success());
    }

    #[test]
    fn test_tri_state() {
        assert_eq!(TriState::from(Some(true)), TriState::True);
        assert_eq!(TriState::from(None), TriState::Unknown);
        assert!(!TriState::Unknown.is_known());
        assert_eq!(TriState::False.to_string(), "False");
    }
}
