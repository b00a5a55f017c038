//! WinRT Backend
//!
//! Implements the platform traits on top of `Windows.Devices.Bluetooth` and
//! `Windows.Devices.Enumeration`.

use crate::domain::error::BleError;
use crate::domain::models::{
    ConnectionStatus, DeviceAddress, PairingOutcome, ProtectionLevel, TriState,
};
use crate::infrastructure::bluetooth::platform::{
    Advertisement, AdvertisementHandler, AdvertisementWatcher, BleDevice, BluetoothPlatform,
    CharacteristicProperties, ClientConfiguration, GattCharacteristic, GattService, GattStatus,
    HandlerToken, PairingCapability, StatusChangedHandler, ValueChangedHandler,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use windows::core::{Ref, GUID};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic as WinGattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Devices::Enumeration::{
    DeviceInformation, DeviceInformationCustomPairing, DevicePairingKinds,
    DevicePairingProtectionLevel, DevicePairingRequestedEventArgs, DevicePairingResultStatus,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, IBuffer};

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn map_connection_status(status: BluetoothConnectionStatus) -> ConnectionStatus {
    match status {
        BluetoothConnectionStatus::Connected => ConnectionStatus::Connected,
        BluetoothConnectionStatus::Disconnected => ConnectionStatus::Disconnected,
        _ => ConnectionStatus::Unknown,
    }
}

fn map_gatt_status(status: GattCommunicationStatus) -> GattStatus {
    match status {
        GattCommunicationStatus::Success => GattStatus::Success,
        GattCommunicationStatus::Unreachable => GattStatus::Unreachable,
        GattCommunicationStatus::AccessDenied => GattStatus::AccessDenied,
        _ => GattStatus::ProtocolError,
    }
}

fn check_enumeration(status: GattCommunicationStatus, what: &str) -> Result<(), BleError> {
    match map_gatt_status(status) {
        GattStatus::Success => Ok(()),
        GattStatus::AccessDenied => Err(BleError::Unauthorized(format!(
            "{} was denied by the device",
            what
        ))),
        other => Err(BleError::platform(format!("{} returned {:?}", what, other))),
    }
}

fn map_pairing_status(status: DevicePairingResultStatus) -> PairingOutcome {
    match status {
        DevicePairingResultStatus::Paired => PairingOutcome::Paired,
        DevicePairingResultStatus::AlreadyPaired => PairingOutcome::AlreadyPaired,
        DevicePairingResultStatus::NotReadyToPair => PairingOutcome::NotReady,
        DevicePairingResultStatus::NotPaired => PairingOutcome::NotPaired,
        DevicePairingResultStatus::AccessDenied => PairingOutcome::AccessDenied,
        DevicePairingResultStatus::ConnectionRejected => PairingOutcome::ConnectionRejected,
        DevicePairingResultStatus::OperationAlreadyInProgress => {
            PairingOutcome::OperationInProgress
        }
        DevicePairingResultStatus::RejectedByHandler => PairingOutcome::Rejected,
        DevicePairingResultStatus::AuthenticationTimeout => PairingOutcome::Timeout,
        DevicePairingResultStatus::PairingCanceled => PairingOutcome::Canceled,
        DevicePairingResultStatus::NoSupportedProfiles => PairingOutcome::Unsupported,
        DevicePairingResultStatus::TooManyConnections
        | DevicePairingResultStatus::HardwareFailure
        | DevicePairingResultStatus::AuthenticationNotAllowed
        | DevicePairingResultStatus::AuthenticationFailure
        | DevicePairingResultStatus::ProtectionLevelCouldNotBeMet
        | DevicePairingResultStatus::InvalidCeremonyData
        | DevicePairingResultStatus::RequiredHandlerNotRegistered
        | DevicePairingResultStatus::RemoteDeviceHasAssociation
        | DevicePairingResultStatus::Failed => PairingOutcome::Failed,
        _ => PairingOutcome::Unknown,
    }
}

pub struct WinRtPlatform;

#[async_trait]
impl BluetoothPlatform for WinRtPlatform {
    async fn device_from_address(
        &self,
        address: DeviceAddress,
    ) -> Result<Option<Arc<dyn BleDevice>>, BleError> {
        match BluetoothLEDevice::FromBluetoothAddressAsync(address.as_u64())?.await {
            Ok(device) => Ok(Some(Arc::new(WinRtDevice { device }) as Arc<dyn BleDevice>)),
            // A null result surfaces as an error carrying S_OK
            Err(e) if e.code().is_ok() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_pairing_candidates(
        &self,
        address: DeviceAddress,
    ) -> Result<Vec<Arc<dyn PairingCapability>>, BleError> {
        let selector = BluetoothLEDevice::GetDeviceSelectorFromBluetoothAddress(address.as_u64())?;
        let records = DeviceInformation::FindAllAsyncAqsFilter(&selector)?.await?;

        let mut candidates = Vec::new();
        for i in 0..records.Size()? {
            let info = records.GetAt(i)?;
            candidates.push(Arc::new(WinRtPairing { info }) as Arc<dyn PairingCapability>);
        }
        info!(
            "Found {} device records for {}",
            candidates.len(),
            address
        );
        Ok(candidates)
    }
}

pub struct WinRtPairing {
    info: DeviceInformation,
}

#[async_trait]
impl PairingCapability for WinRtPairing {
    fn id(&self) -> String {
        self.info.Id().map(|id| id.to_string()).unwrap_or_default()
    }

    fn is_paired(&self) -> TriState {
        TriState::from(self.info.Pairing().and_then(|p| p.IsPaired()).ok())
    }

    fn can_pair(&self) -> TriState {
        TriState::from(self.info.Pairing().and_then(|p| p.CanPair()).ok())
    }

    async fn pair(&self, level: ProtectionLevel) -> Result<PairingOutcome, BleError> {
        let pairing = self.info.Pairing()?;
        let protection = match level {
            ProtectionLevel::None => DevicePairingProtectionLevel::None,
            ProtectionLevel::Encryption => DevicePairingProtectionLevel::Encryption,
        };

        let result = match pairing.Custom() {
            Ok(custom) => {
                // Accept the confirmation ceremony without user interaction
                let accept = TypedEventHandler::new(
                    move |_: Ref<DeviceInformationCustomPairing>,
                          args: Ref<DevicePairingRequestedEventArgs>| {
                        if let Some(args) = args.as_ref() {
                            args.Accept()?;
                        }
                        Ok(())
                    },
                );
                let token = custom.PairingRequested(&accept)?;
                let result = custom
                    .PairWithProtectionLevelAsync(DevicePairingKinds::ConfirmOnly, protection)?
                    .await;
                let _ = custom.RemovePairingRequested(token);
                result?
            }
            Err(_) => pairing.PairWithProtectionLevelAsync(protection)?.await?,
        };

        let status = result.Status()?;
        debug!("Pairing {} at {} returned {:?}", self.id(), level, status);
        Ok(map_pairing_status(status))
    }
}

pub struct WinRtDevice {
    device: BluetoothLEDevice,
}

#[async_trait]
impl BleDevice for WinRtDevice {
    fn platform_id(&self) -> String {
        self.device
            .DeviceId()
            .map(|id| id.to_string())
            .unwrap_or_default()
    }

    fn pairing(&self) -> Option<Arc<dyn PairingCapability>> {
        self.device
            .DeviceInformation()
            .ok()
            .map(|info| Arc::new(WinRtPairing { info }) as Arc<dyn PairingCapability>)
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.device
            .ConnectionStatus()
            .map(map_connection_status)
            .unwrap_or_default()
    }

    fn add_status_handler(
        &self,
        on_status: StatusChangedHandler,
    ) -> Result<HandlerToken, BleError> {
        let handler = TypedEventHandler::new(move |dev: Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                if let Ok(status) = dev.ConnectionStatus() {
                    on_status(map_connection_status(status));
                }
            }
            Ok(())
        });
        Ok(HandlerToken(self.device.ConnectionStatusChanged(&handler)?))
    }

    fn remove_status_handler(&self, token: HandlerToken) {
        let _ = self.device.RemoveConnectionStatusChanged(token.0);
    }

    async fn gatt_services(&self) -> Result<Vec<Arc<dyn GattService>>, BleError> {
        let result = self
            .device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        check_enumeration(result.Status()?, "Service enumeration")?;

        let services = result.Services()?;
        let mut out = Vec::new();
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            out.push(Arc::new(WinRtService { service }) as Arc<dyn GattService>);
        }
        Ok(out)
    }

    fn close(&self) {
        let _ = self.device.Close();
    }
}

pub struct WinRtService {
    service: GattDeviceService,
}

#[async_trait]
impl GattService for WinRtService {
    fn uuid(&self) -> Uuid {
        self.service.Uuid().map(to_uuid).unwrap_or_default()
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>, BleError> {
        let service_uuid = self.uuid();
        let result = self
            .service
            .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        check_enumeration(result.Status()?, "Characteristic enumeration")?;

        let characteristics = result.Characteristics()?;
        let mut out = Vec::new();
        for i in 0..characteristics.Size()? {
            let characteristic = characteristics.GetAt(i)?;
            out.push(Arc::new(WinRtCharacteristic {
                characteristic,
                service_uuid,
            }) as Arc<dyn GattCharacteristic>);
        }
        Ok(out)
    }
}

pub struct WinRtCharacteristic {
    characteristic: WinGattCharacteristic,
    service_uuid: Uuid,
}

#[async_trait]
impl GattCharacteristic for WinRtCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.Uuid().map(to_uuid).unwrap_or_default()
    }

    fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    fn properties(&self) -> CharacteristicProperties {
        let properties = self
            .characteristic
            .CharacteristicProperties()
            .unwrap_or_default();
        CharacteristicProperties {
            notify: properties.contains(GattCharacteristicProperties::Notify),
            indicate: properties.contains(GattCharacteristicProperties::Indicate),
        }
    }

    async fn write_client_configuration(
        &self,
        value: ClientConfiguration,
    ) -> Result<GattStatus, BleError> {
        let value = match value {
            ClientConfiguration::None => GattClientCharacteristicConfigurationDescriptorValue::None,
            ClientConfiguration::Notify => {
                GattClientCharacteristicConfigurationDescriptorValue::Notify
            }
            ClientConfiguration::Indicate => {
                GattClientCharacteristicConfigurationDescriptorValue::Indicate
            }
        };
        let status = self
            .characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(value)?
            .await?;
        Ok(map_gatt_status(status))
    }

    fn add_value_handler(&self, on_value: ValueChangedHandler) -> Result<HandlerToken, BleError> {
        let handler = TypedEventHandler::new(
            move |_: Ref<WinGattCharacteristic>, args: Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = args.CharacteristicValue()?;
                    on_value(read_buffer(&value)?);
                }
                Ok(())
            },
        );
        Ok(HandlerToken(self.characteristic.ValueChanged(&handler)?))
    }

    fn remove_value_handler(&self, token: HandlerToken) {
        let _ = self.characteristic.RemoveValueChanged(token.0);
    }
}

pub struct WinRtWatcher {
    watcher: BluetoothLEAdvertisementWatcher,
}

impl WinRtWatcher {
    pub fn new() -> Result<Self, BleError> {
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;
        Ok(Self { watcher })
    }
}

impl AdvertisementWatcher for WinRtWatcher {
    fn add_handler(
        &mut self,
        on_advertisement: AdvertisementHandler,
    ) -> Result<HandlerToken, BleError> {
        let handler = TypedEventHandler::new(
            move |_: Ref<BluetoothLEAdvertisementWatcher>,
                  args: Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let local_name = args.Advertisement()?.LocalName()?.to_string();
                    match DeviceAddress::new(args.BluetoothAddress()?) {
                        Ok(address) => on_advertisement(Advertisement {
                            address,
                            local_name,
                            rssi: args.RawSignalStrengthInDBm()?,
                        }),
                        Err(e) => debug!("Ignoring advertisement: {}", e),
                    }
                }
                Ok(())
            },
        );
        Ok(HandlerToken(self.watcher.Received(&handler)?))
    }

    fn remove_handler(&mut self, token: HandlerToken) {
        let _ = self.watcher.RemoveReceived(token.0);
    }

    fn start(&mut self) -> Result<(), BleError> {
        self.watcher.Start()?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BleError> {
        self.watcher.Stop()?;
        Ok(())
    }
}
