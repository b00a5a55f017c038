//! Bluetooth Module
//!
//! Connects to a BLE peripheral, pairs it when required, subscribes to its
//! notifying characteristics and decodes what they send.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (use-case boundary, republishes everything as AppEvent)│
//! └──────┬──────────────┬───────────────┬──────────────┬────┘
//!        │              │               │              │
//!        ▼              ▼               ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────────┐ ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Subscription │ │ Protocol │
//! │           │  │            │  │              │ │          │
//! │ - adverts │  │ - pairing  │  │ - CCCD write │ │ - decoder│
//! │           │  │ - fallback │  │ - rollback   │ │   registry│
//! └─────┬─────┘  └─────┬──────┘  └──────┬───────┘ └──────────┘
//!       │              │                │
//!       ▼              ▼                ▼
//! ┌─────────────────────────────────────────────┐
//! │   platform traits (WinRT / unsupported)      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`platform`] - Traits the core talks to, plus the unsupported backend
//! - [`pairing`] - Two-level pairing escalation
//! - [`connection`] - Device connector with the alternate discovery round
//! - [`subscription`] - GATT notification subscriptions
//! - [`protocol`] - Measurement decoders and the registry
//! - [`scanner`] - BLE device discovery
//! - [`service`] - Main service coordinator

pub mod connection;
pub mod pairing;
pub mod platform;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod subscription;

#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub(crate) mod fakes;

use crate::domain::error::BleError;
use platform::{AdvertisementWatcher, BluetoothPlatform};
use std::sync::Arc;

// Re-export main service for convenience
pub use service::BluetoothService;

/// Platform binding for the current target
pub struct Backend {
    pub platform: Arc<dyn BluetoothPlatform>,
    pub watcher: Box<dyn AdvertisementWatcher>,
}

#[cfg(windows)]
pub fn native_backend() -> Result<Backend, BleError> {
    Ok(Backend {
        platform: Arc::new(winrt::WinRtPlatform),
        watcher: Box::new(winrt::WinRtWatcher::new()?),
    })
}

#[cfg(not(windows))]
pub fn native_backend() -> Result<Backend, BleError> {
    tracing::warn!("No native Bluetooth binding for this target");
    Ok(Backend {
        platform: Arc::new(platform::UnsupportedPlatform),
        watcher: Box::new(platform::UnsupportedWatcher),
    })
}
