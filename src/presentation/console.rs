//! Console rendering for the command line front end.

use crate::domain::models::{
    AppEvent, DecodedMeasurement, DeviceAddress, DiscoveredDevice, MessageSeverity, StatusMessage,
};
use std::collections::HashMap;

/// Devices seen during a scan, deduplicated by address
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: HashMap<DeviceAddress, DiscoveredDevice>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting; returns `true` the first time an address is seen.
    /// Later sightings refresh the signal strength and a real name replaces
    /// "Unknown".
    pub fn observe(&mut self, device: DiscoveredDevice) -> bool {
        match self.devices.get_mut(&device.address) {
            Some(known) => {
                known.signal_strength = device.signal_strength;
                if known.name == "Unknown" {
                    known.name = device.name;
                }
                false
            }
            None => {
                self.devices.insert(device.address, device);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Strongest signal first
    pub fn by_signal(&self) -> Vec<&DiscoveredDevice> {
        let mut devices: Vec<_> = self.devices.values().collect();
        devices.sort_by(|a, b| {
            b.signal_strength
                .cmp(&a.signal_strength)
                .then(a.address.cmp(&b.address))
        });
        devices
    }
}

pub fn format_device(device: &DiscoveredDevice) -> String {
    format!(
        "{}  {:>4} dBm  {}",
        device.address, device.signal_strength, device.name
    )
}

pub fn format_measurement(measurement: &DecodedMeasurement) -> String {
    let summary = measurement.summary();
    format!(
        "[{}] {} {} {} | {}",
        measurement.timestamp.format("%H:%M:%S%.3f"),
        measurement.name,
        measurement.characteristic_id,
        summary,
        measurement.raw_hex
    )
}

pub fn format_status(status: &StatusMessage) -> String {
    let tag = match status.severity {
        MessageSeverity::Info => "info",
        MessageSeverity::Success => "ok",
        MessageSeverity::Warning => "warn",
        MessageSeverity::Error => "error",
    };
    format!("[{}] {}", tag, status.message)
}

/// One printable line per event; scan results are handled by [`DeviceTable`]
pub fn format_event(event: &AppEvent) -> Option<String> {
    match event {
        AppEvent::DeviceDiscovered(_) => None,
        AppEvent::MeasurementReceived(measurement) => Some(format_measurement(measurement)),
        AppEvent::ConnectionStateChanged(true) => Some("[link] connected".to_string()),
        AppEvent::ConnectionStateChanged(false) => Some("[link] disconnected".to_string()),
        AppEvent::LogMessage(status) => Some(format_status(status)),
    }
}
