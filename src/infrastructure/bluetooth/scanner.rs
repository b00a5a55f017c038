//! BLE Scanner Module
//!
//! Turns advertisements into [`DiscoveredDevice`] events. No filtering or
//! deduplication happens here.

use crate::domain::error::BleError;
use crate::domain::models::DiscoveredDevice;
use crate::domain::observers::Observers;
use crate::infrastructure::bluetooth::platform::{
    Advertisement, AdvertisementHandler, AdvertisementWatcher, HandlerToken,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, trace};

pub struct BleScanner {
    watcher: Box<dyn AdvertisementWatcher>,
    handler_token: Option<HandlerToken>,
    devices: Observers<DiscoveredDevice>,
}

impl BleScanner {
    pub fn new(watcher: Box<dyn AdvertisementWatcher>) -> Self {
        Self {
            watcher,
            handler_token: None,
            devices: Observers::new(),
        }
    }

    pub fn device_events(&self) -> mpsc::UnboundedReceiver<DiscoveredDevice> {
        self.devices.subscribe()
    }

    /// Start scanning; no-op when already running
    pub fn start(&mut self) -> Result<(), BleError> {
        if self.handler_token.is_some() {
            return Ok(());
        }

        info!("Starting BLE scan...");
        let observers = self.devices.clone();
        let handler: AdvertisementHandler = Arc::new(move |advertisement: Advertisement| {
            let device = DiscoveredDevice::new(
                advertisement.address,
                advertisement.local_name,
                advertisement.rssi,
            );
            trace!("Advertisement: {}", device);
            observers.publish(device);
        });

        let token = self.watcher.add_handler(handler)?;
        if let Err(e) = self.watcher.start() {
            self.watcher.remove_handler(token);
            return Err(e);
        }
        self.handler_token = Some(token);
        Ok(())
    }

    /// Stop scanning; no-op when not running
    pub fn stop(&mut self) -> Result<(), BleError> {
        let Some(token) = self.handler_token.take() else {
            return Ok(());
        };

        info!("Stopping BLE scan...");
        let result = self.watcher.stop();
        self.watcher.remove_handler(token);
        result
    }

    pub fn is_scanning(&self) -> bool {
        self.handler_token.is_some()
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
