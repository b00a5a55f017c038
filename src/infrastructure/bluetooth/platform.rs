//! Platform seam
//!
//! The connector, subscription manager and scanner only talk to these
//! traits. The WinRT backend implements them on Windows; other targets get
//! [`UnsupportedPlatform`].

use crate::domain::error::BleError;
use crate::domain::models::{
    ConnectionStatus, DeviceAddress, PairingOutcome, ProtectionLevel, TriState,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

pub type StatusChangedHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;
pub type ValueChangedHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
pub type AdvertisementHandler = Arc<dyn Fn(Advertisement) + Send + Sync>;

/// Registration returned by the platform when a handler is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(pub i64);

/// Fields of a received advertisement the scanner cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub local_name: String,
    pub rssi: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Notify is preferred when both are advertised
    pub fn subscription_kind(&self) -> Option<ClientConfiguration> {
        if self.notify {
            Some(ClientConfiguration::Notify)
        } else if self.indicate {
            Some(ClientConfiguration::Indicate)
        } else {
            None
        }
    }
}

/// Value written to the client characteristic configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientConfiguration {
    None,
    Notify,
    Indicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Unreachable,
    ProtocolError,
    AccessDenied,
}

/// Pairing surface of one platform device record
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PairingCapability: Send + Sync {
    fn id(&self) -> String;
    fn is_paired(&self) -> TriState;
    fn can_pair(&self) -> TriState;
    async fn pair(&self, level: ProtectionLevel) -> Result<PairingOutcome, BleError>;
}

/// An open handle to a BLE peripheral
#[async_trait]
pub trait BleDevice: Send + Sync {
    fn platform_id(&self) -> String;
    fn pairing(&self) -> Option<Arc<dyn PairingCapability>>;
    fn connection_status(&self) -> ConnectionStatus;
    fn add_status_handler(&self, handler: StatusChangedHandler) -> Result<HandlerToken, BleError>;
    fn remove_status_handler(&self, token: HandlerToken);
    /// Uncached service enumeration
    async fn gatt_services(&self) -> Result<Vec<Arc<dyn GattService>>, BleError>;
    fn close(&self);
}

#[async_trait]
pub trait GattService: Send + Sync {
    fn uuid(&self) -> Uuid;
    /// Uncached characteristic enumeration
    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>, BleError>;
}

#[async_trait]
pub trait GattCharacteristic: Send + Sync {
    fn uuid(&self) -> Uuid;
    fn service_uuid(&self) -> Uuid;
    fn properties(&self) -> CharacteristicProperties;
    async fn write_client_configuration(
        &self,
        value: ClientConfiguration,
    ) -> Result<GattStatus, BleError>;
    fn add_value_handler(&self, handler: ValueChangedHandler) -> Result<HandlerToken, BleError>;
    fn remove_value_handler(&self, token: HandlerToken);
}

/// Device lookup and alternate discovery
#[async_trait]
pub trait BluetoothPlatform: Send + Sync {
    async fn device_from_address(
        &self,
        address: DeviceAddress,
    ) -> Result<Option<Arc<dyn BleDevice>>, BleError>;

    /// Device records the platform knows for `address`, used when direct
    /// pairing is refused
    async fn find_pairing_candidates(
        &self,
        address: DeviceAddress,
    ) -> Result<Vec<Arc<dyn PairingCapability>>, BleError>;
}

pub trait AdvertisementWatcher: Send {
    fn add_handler(&mut self, handler: AdvertisementHandler) -> Result<HandlerToken, BleError>;
    fn remove_handler(&mut self, token: HandlerToken);
    fn start(&mut self) -> Result<(), BleError>;
    fn stop(&mut self) -> Result<(), BleError>;
}

/// Race a platform call against `cancel`; the loser is dropped.
pub async fn cancellable<T, F>(cancel: &CancellationToken, operation: F) -> Result<T, BleError>
where
    F: Future<Output = Result<T, BleError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BleError::Canceled),
        result = operation => result,
    }
}

const UNSUPPORTED: &str = "Bluetooth LE is only available on Windows in this build";

/// Backend for targets without a native binding
pub struct UnsupportedPlatform;

#[async_trait]
impl BluetoothPlatform for UnsupportedPlatform {
    async fn device_from_address(
        &self,
        _address: DeviceAddress,
    ) -> Result<Option<Arc<dyn BleDevice>>, BleError> {
        Err(BleError::platform(UNSUPPORTED))
    }

    async fn find_pairing_candidates(
        &self,
        _address: DeviceAddress,
    ) -> Result<Vec<Arc<dyn PairingCapability>>, BleError> {
        Err(BleError::platform(UNSUPPORTED))
    }
}

pub struct UnsupportedWatcher;

impl AdvertisementWatcher for UnsupportedWatcher {
    fn add_handler(&mut self, _handler: AdvertisementHandler) -> Result<HandlerToken, BleError> {
        Ok(HandlerToken(0))
    }

    fn remove_handler(&mut self, _token: HandlerToken) {}

    fn start(&mut self) -> Result<(), BleError> {
        Err(BleError::platform(UNSUPPORTED))
    }

    fn stop(&mut self) -> Result<(), BleError> {
        Ok(())
    }
}
