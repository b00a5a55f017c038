//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, connection, subscription and
//! decoding, and republishes everything as [`AppEvent`]s on one channel.

use crate::domain::error::BleError;
use crate::domain::models::{
    AppEvent, ConnectionDiagnostics, DecodedMeasurement, DeviceAddress, MessageSeverity,
    RawMeasurement, StatusMessage,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{
    connection::DeviceConnector,
    platform::{AdvertisementWatcher, BluetoothPlatform},
    protocol::ProtocolRegistry,
    scanner::BleScanner,
    subscription::SubscriptionManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, warn};

/// Appended to connect results and to `Unauthorized` failures
pub const CONNECT_GUIDANCE: &str = "Enable Location Services, ensure no other central is connected, and try pairing in system Bluetooth settings.";

/// Configuration for service behavior
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deadline for connect, subscribe, unsubscribe and subscription rollback
    pub operation_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            operation_timeout: settings.operation_timeout(),
        }
    }
}

/// Result of a successful connect
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub diagnostics: ConnectionDiagnostics,
    /// Diagnostic notes followed by the guidance line
    pub messages: Vec<String>,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    scanner: BleScanner,
    connector: DeviceConnector,
    subscriptions: SubscriptionManager,
    registry: Arc<ProtocolRegistry>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    connected_address: Option<DeviceAddress>,
    config: ServiceConfig,
    cancel_root: CancellationToken,
    forwarders: Vec<JoinHandle<()>>,
}

impl BluetoothService {
    /// Create a new Bluetooth service. Must be called inside a tokio runtime.
    pub fn new(
        platform: Arc<dyn BluetoothPlatform>,
        watcher: Box<dyn AdvertisementWatcher>,
        registry: ProtocolRegistry,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        config: ServiceConfig,
    ) -> Self {
        let scanner = BleScanner::new(watcher);
        let connector = DeviceConnector::new(platform);
        let subscriptions =
            SubscriptionManager::new(connector.device_accessor(), config.operation_timeout);
        let registry = Arc::new(registry);

        let forwarders = vec![
            forward(
                scanner.device_events(),
                event_sender.clone(),
                AppEvent::DeviceDiscovered,
            ),
            forward(
                connector.connection_events(),
                event_sender.clone(),
                AppEvent::ConnectionStateChanged,
            ),
            forward_measurements(
                subscriptions.measurement_events(),
                event_sender.clone(),
                registry.clone(),
            ),
        ];

        Self {
            scanner,
            connector,
            subscriptions,
            registry,
            event_sender,
            connected_address: None,
            config,
            cancel_root: CancellationToken::new(),
            forwarders,
        }
    }

    /// Start scanning for devices
    pub fn start_scan(&mut self) -> Result<(), BleError> {
        if self.scanner.is_scanning() {
            return Ok(());
        }
        match self.scanner.start() {
            Ok(()) => {
                self.send_log("Scanning for devices...", MessageSeverity::Info);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start scan: {}", e);
                self.send_log(&format!("Scan failed: {}", e), MessageSeverity::Error);
                Err(e)
            }
        }
    }

    /// Stop scanning
    pub fn stop_scan(&mut self) -> Result<(), BleError> {
        if !self.scanner.is_scanning() {
            return Ok(());
        }
        self.scanner.stop()?;
        self.send_log("Scan stopped.", MessageSeverity::Info);
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Connect to a device by address
    pub async fn connect(&mut self, address: DeviceAddress) -> Result<ConnectResponse, BleError> {
        if self.connector.is_connected() {
            warn!("Connect to {} refused: already connected", address);
            return Err(BleError::AlreadyConnected);
        }

        self.connected_address = None;
        self.send_log(&format!("Connecting to {}...", address), MessageSeverity::Info);

        // Subscriptions belong to the handle the connector is about to release
        self.unsubscribe().await;

        let (cancel, _deadline) = self.begin_operation();
        match self.connector.connect(address, &cancel).await {
            Ok(diagnostics) => {
                self.connected_address = Some(address);
                let mut messages = diagnostics.notes.clone();
                messages.push(CONNECT_GUIDANCE.to_string());
                self.send_log(&format!("Connected to {}", address), MessageSeverity::Success);
                Ok(ConnectResponse {
                    diagnostics,
                    messages,
                })
            }
            Err(BleError::Unauthorized(reason)) => {
                let message = format!("{} {}", reason, CONNECT_GUIDANCE);
                error!("Access to {} denied: {}", address, reason);
                self.send_log(&message, MessageSeverity::Error);
                Err(BleError::Unauthorized(message))
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", address, e);
                self.send_log(&format!("Connection failed: {}", e), MessageSeverity::Error);
                Err(e)
            }
        }
    }

    /// Enable notifications on the connected device
    pub async fn subscribe(&mut self) -> Result<(), BleError> {
        let address = match self.connected_address {
            Some(address) if self.connector.has_device() => address,
            _ => return Err(BleError::NotConnected),
        };
        if self.subscriptions.is_subscribed() {
            return Ok(());
        }

        let (cancel, _deadline) = self.begin_operation();
        if let Err(e) = self.subscriptions.subscribe(address, &cancel).await {
            error!("Failed to subscribe to {}: {}", address, e);
            self.send_log(&format!("Subscription failed: {}", e), MessageSeverity::Error);
            return Err(e);
        }

        let count = self.subscriptions.subscribed_count();
        self.send_log(
            &format!("Listening on {} characteristics", count),
            MessageSeverity::Success,
        );
        Ok(())
    }

    /// Disable notifications; never fails
    pub async fn unsubscribe(&mut self) {
        let (cancel, _deadline) = self.begin_operation();
        self.subscriptions.unsubscribe(&cancel).await;
    }

    /// Disconnect from the current device
    pub async fn disconnect(&mut self) -> Result<(), BleError> {
        if !self.connector.has_device() {
            return Err(BleError::NotConnected);
        }

        self.unsubscribe().await;
        self.connector.disconnect();
        self.connected_address = None;

        self.send_log("Disconnected from device", MessageSeverity::Info);
        Ok(())
    }

    /// Decode a measurement through the registry
    pub fn decode(&self, measurement: &RawMeasurement) -> DecodedMeasurement {
        self.registry.decode(measurement)
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscriptions.is_subscribed()
    }

    /// Cancelling the returned token aborts the operation in flight.
    /// Later operations start from a fresh token.
    pub fn cancellation_handle(&self) -> CancellationToken {
        self.cancel_root.clone()
    }

    /// Token for one operation, cancelled by the deadline or by the root
    /// handle. The guard stops the deadline timer.
    fn begin_operation(&mut self) -> (CancellationToken, DropGuard) {
        if self.cancel_root.is_cancelled() {
            self.cancel_root = CancellationToken::new();
        }
        let token = self.cancel_root.child_token();
        let deadline = token.clone();
        let timeout = self.config.operation_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!("Operation timed out after {:?}", timeout);
                    deadline.cancel();
                }
                _ = deadline.cancelled() => {}
            }
        });
        let guard = token.clone().drop_guard();
        (token, guard)
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl Drop for BluetoothService {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

fn forward<T: Send + 'static>(
    mut events: mpsc::UnboundedReceiver<T>,
    sender: mpsc::UnboundedSender<AppEvent>,
    wrap: fn(T) -> AppEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if sender.send(wrap(event)).is_err() {
                break;
            }
        }
    })
}

fn forward_measurements(
    mut measurements: mpsc::UnboundedReceiver<RawMeasurement>,
    sender: mpsc::UnboundedSender<AppEvent>,
    registry: Arc<ProtocolRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(measurement) = measurements.recv().await {
            let decoded = registry.decode(&measurement);
            if sender.send(AppEvent::MeasurementReceived(decoded)).is_err() {
                break;
            }
        }
    })
}
