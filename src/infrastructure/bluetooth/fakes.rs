//! In-memory platform used by the unit tests.

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
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

static NEXT_TOKEN: AtomicI64 = AtomicI64::new(1);

fn next_token() -> HandlerToken {
    HandlerToken(NEXT_TOKEN.fetch_add(1, Ordering::SeqCst))
}

/// Scripted pairing record; a successful outcome flips `is_paired`
pub struct FakePairing {
    pub id: String,
    pub is_paired: Mutex<TriState>,
    pub can_pair: TriState,
    pub outcomes: Mutex<VecDeque<PairingOutcome>>,
    pub calls: Mutex<Vec<ProtectionLevel>>,
}

impl FakePairing {
    pub fn new(id: &str, is_paired: TriState, can_pair: TriState) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            is_paired: Mutex::new(is_paired),
            can_pair,
            outcomes: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn with_outcomes(self: Arc<Self>, outcomes: &[PairingOutcome]) -> Arc<Self> {
        self.outcomes.lock().unwrap().extend(outcomes.iter().copied());
        self
    }

    pub fn calls(&self) -> Vec<ProtectionLevel> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PairingCapability for FakePairing {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn is_paired(&self) -> TriState {
        *self.is_paired.lock().unwrap()
    }

    fn can_pair(&self) -> TriState {
        self.can_pair
    }

    async fn pair(&self, level: ProtectionLevel) -> Result<PairingOutcome, BleError> {
        self.calls.lock().unwrap().push(level);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PairingOutcome::Failed);
        if outcome.is_success() {
            *self.is_paired.lock().unwrap() = TriState::True;
        }
        Ok(outcome)
    }
}

pub struct FakeCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub status: Mutex<GattStatus>,
    pub hang_on_enable: AtomicBool,
    pub hang_on_disable: AtomicBool,
    pub writes: Mutex<Vec<ClientConfiguration>>,
    pub handlers: Mutex<HashMap<HandlerToken, ValueChangedHandler>>,
    pub handlers_removed: AtomicUsize,
}

impl FakeCharacteristic {
    pub fn new(service_uuid: Uuid, uuid: Uuid, notify: bool, indicate: bool) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            service_uuid,
            properties: CharacteristicProperties { notify, indicate },
            status: Mutex::new(GattStatus::Success),
            hang_on_enable: AtomicBool::new(false),
            hang_on_disable: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            handlers_removed: AtomicUsize::new(0),
        })
    }

    pub fn emit(&self, bytes: &[u8]) {
        let handlers: Vec<_> = self.handlers.lock().unwrap().values().cloned().collect();
        for handler in handlers {
            handler(bytes.to_vec());
        }
    }

    pub fn writes(&self) -> Vec<ClientConfiguration> {
        self.writes.lock().unwrap().clone()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }
}

#[async_trait]
impl GattCharacteristic for FakeCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    async fn write_client_configuration(
        &self,
        value: ClientConfiguration,
    ) -> Result<GattStatus, BleError> {
        let hang = if value == ClientConfiguration::None {
            &self.hang_on_disable
        } else {
            &self.hang_on_enable
        };
        if hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.writes.lock().unwrap().push(value);
        Ok(*self.status.lock().unwrap())
    }

    fn add_value_handler(&self, handler: ValueChangedHandler) -> Result<HandlerToken, BleError> {
        let token = next_token();
        self.handlers.lock().unwrap().insert(token, handler);
        Ok(token)
    }

    fn remove_value_handler(&self, token: HandlerToken) {
        if self.handlers.lock().unwrap().remove(&token).is_some() {
            self.handlers_removed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct FakeService {
    pub uuid: Uuid,
    pub characteristics: Vec<Arc<FakeCharacteristic>>,
    pub fail: bool,
}

impl FakeService {
    pub fn new(uuid: Uuid, characteristics: Vec<Arc<FakeCharacteristic>>) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            characteristics,
            fail: false,
        })
    }

    pub fn failing(uuid: Uuid) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            characteristics: Vec::new(),
            fail: true,
        })
    }
}

#[async_trait]
impl GattService for FakeService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn GattCharacteristic>>, BleError> {
        if self.fail {
            return Err(BleError::platform("characteristic enumeration failed"));
        }
        Ok(self
            .characteristics
            .iter()
            .map(|c| c.clone() as Arc<dyn GattCharacteristic>)
            .collect())
    }
}

pub struct FakeDevice {
    pub id: String,
    pub pairing: Option<Arc<dyn PairingCapability>>,
    pub status: Mutex<ConnectionStatus>,
    pub services: Vec<Arc<FakeService>>,
    pub closed: AtomicUsize,
    pub status_handlers: Mutex<HashMap<HandlerToken, StatusChangedHandler>>,
}

impl FakeDevice {
    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap() = status;
        let handlers: Vec<_> = self
            .status_handlers
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            handler(status);
        }
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn status_handler_count(&self) -> usize {
        self.status_handlers.lock().unwrap().len()
    }
}

#[async_trait]
impl BleDevice for FakeDevice {
    fn platform_id(&self) -> String {
        self.id.clone()
    }

    fn pairing(&self) -> Option<Arc<dyn PairingCapability>> {
        self.pairing.clone()
    }

    fn connection_status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    fn add_status_handler(&self, handler: StatusChangedHandler) -> Result<HandlerToken, BleError> {
        let token = next_token();
        self.status_handlers.lock().unwrap().insert(token, handler);
        Ok(token)
    }

    fn remove_status_handler(&self, token: HandlerToken) {
        self.status_handlers.lock().unwrap().remove(&token);
    }

    async fn gatt_services(&self) -> Result<Vec<Arc<dyn GattService>>, BleError> {
        Ok(self
            .services
            .iter()
            .map(|s| s.clone() as Arc<dyn GattService>)
            .collect())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out a fresh [`FakeDevice`] per lookup, all sharing one pairing record
pub struct FakePlatform {
    pub pairing: Option<Arc<dyn PairingCapability>>,
    pub status: ConnectionStatus,
    pub services: Vec<Arc<FakeService>>,
    pub candidates: Vec<Arc<dyn PairingCapability>>,
    pub missing: bool,
    pub devices: Mutex<Vec<Arc<FakeDevice>>>,
    pub candidate_lookups: AtomicUsize,
}

impl FakePlatform {
    pub fn new(pairing: Option<Arc<dyn PairingCapability>>) -> Self {
        Self {
            pairing,
            status: ConnectionStatus::Connected,
            services: Vec::new(),
            candidates: Vec::new(),
            missing: false,
            devices: Mutex::new(Vec::new()),
            candidate_lookups: AtomicUsize::new(0),
        }
    }

    pub fn devices(&self) -> Vec<Arc<FakeDevice>> {
        self.devices.lock().unwrap().clone()
    }

    pub fn last_device(&self) -> Arc<FakeDevice> {
        self.devices().last().cloned().expect("no device was opened")
    }
}

#[async_trait]
impl BluetoothPlatform for FakePlatform {
    async fn device_from_address(
        &self,
        address: DeviceAddress,
    ) -> Result<Option<Arc<dyn BleDevice>>, BleError> {
        if self.missing {
            return Ok(None);
        }
        let mut devices = self.devices.lock().unwrap();
        let device = Arc::new(FakeDevice {
            id: format!("BluetoothLE#{}#{}", address, devices.len()),
            pairing: self.pairing.clone(),
            status: Mutex::new(self.status),
            services: self.services.clone(),
            closed: AtomicUsize::new(0),
            status_handlers: Mutex::new(HashMap::new()),
        });
        devices.push(device.clone());
        Ok(Some(device))
    }

    async fn find_pairing_candidates(
        &self,
        _address: DeviceAddress,
    ) -> Result<Vec<Arc<dyn PairingCapability>>, BleError> {
        self.candidate_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.candidates.clone())
    }
}

#[derive(Default)]
pub struct FakeWatcher {
    pub handlers: Arc<Mutex<HashMap<HandlerToken, AdvertisementHandler>>>,
    pub running: Arc<AtomicBool>,
    pub fail_start: bool,
    pub starts: Arc<AtomicUsize>,
}

impl FakeWatcher {
    /// Shared view used to drive the watcher after it moved into a scanner
    pub fn probe(&self) -> WatcherProbe {
        WatcherProbe {
            handlers: self.handlers.clone(),
            running: self.running.clone(),
            starts: self.starts.clone(),
        }
    }
}

impl AdvertisementWatcher for FakeWatcher {
    fn add_handler(&mut self, handler: AdvertisementHandler) -> Result<HandlerToken, BleError> {
        let token = next_token();
        self.handlers.lock().unwrap().insert(token, handler);
        Ok(token)
    }

    fn remove_handler(&mut self, token: HandlerToken) {
        self.handlers.lock().unwrap().remove(&token);
    }

    fn start(&mut self) -> Result<(), BleError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(BleError::platform("radio off"));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BleError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct WatcherProbe {
    pub handlers: Arc<Mutex<HashMap<HandlerToken, AdvertisementHandler>>>,
    pub running: Arc<AtomicBool>,
    pub starts: Arc<AtomicUsize>,
}

impl WatcherProbe {
    pub fn advertise(&self, address: u64, name: &str, rssi: i16) {
        let advertisement = Advertisement {
            address: DeviceAddress::new(address).unwrap(),
            local_name: name.to_string(),
            rssi,
        };
        let handlers: Vec<_> = self.handlers.lock().unwrap().values().cloned().collect();
        for handler in handlers {
            handler(advertisement.clone());
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
