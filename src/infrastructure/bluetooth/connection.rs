//! BLE Connection Module
//!
//! Opens a device handle, pairs it when needed and keeps the connection
//! state observers informed.
//!
//! When direct pairing is refused the connector runs one alternate
//! discovery round: it pairs through another platform record for the same
//! address and then repeats the direct path once with the round disabled.

use crate::domain::diagnostics::{DiagnosticsBuilder, PairingView};
use crate::domain::error::BleError;
use crate::domain::models::{ConnectionDiagnostics, ConnectionStatus, DeviceAddress};
use crate::domain::observers::Observers;
use crate::infrastructure::bluetooth::pairing::{ensure_paired, read_view};
use crate::infrastructure::bluetooth::platform::{
    cancellable, BleDevice, BluetoothPlatform, HandlerToken, StatusChangedHandler,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Yields the currently held device handle, if any
pub type DeviceAccessor = Arc<dyn Fn() -> Option<Arc<dyn BleDevice>> + Send + Sync>;

struct HeldDevice {
    device: Arc<dyn BleDevice>,
    status_token: HandlerToken,
}

pub struct DeviceConnector {
    platform: Arc<dyn BluetoothPlatform>,
    held: Option<HeldDevice>,
    shared: Arc<Mutex<Option<Arc<dyn BleDevice>>>>,
    state_changed: Observers<bool>,
}

impl DeviceConnector {
    pub fn new(platform: Arc<dyn BluetoothPlatform>) -> Self {
        Self {
            platform,
            held: None,
            shared: Arc::new(Mutex::new(None)),
            state_changed: Observers::new(),
        }
    }

    /// Receive `true`/`false` whenever the link state changes
    pub fn connection_events(&self) -> mpsc::UnboundedReceiver<bool> {
        self.state_changed.subscribe()
    }

    pub fn device_accessor(&self) -> DeviceAccessor {
        let shared = self.shared.clone();
        Arc::new(move || {
            shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// A handle is held, whatever its link state
    pub fn has_device(&self) -> bool {
        self.held.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.held
            .as_ref()
            .map(|held| held.device.connection_status() == ConnectionStatus::Connected)
            .unwrap_or(false)
    }

    /// Connect to the device at `address`, pairing it if required
    pub async fn connect(
        &mut self,
        address: DeviceAddress,
        cancel: &CancellationToken,
    ) -> Result<ConnectionDiagnostics, BleError> {
        if self.release() {
            info!("Released previously held device before connecting");
        }

        info!("Connecting to Bluetooth device: {}", address);
        let mut diagnostics = DiagnosticsBuilder::new();
        let mut fallback_available = true;

        loop {
            match self.open_paired(address, cancel, &mut diagnostics).await {
                Ok(device) => return self.attach(device, diagnostics),
                Err(BleError::Unauthorized(reason)) if fallback_available => {
                    fallback_available = false;
                    warn!("Direct pairing was refused: {}", reason);
                    diagnostics.note(format!("Unauthorized access encountered: {}", reason));
                    if !self
                        .pair_via_alternate_discovery(address, cancel, &mut diagnostics)
                        .await?
                    {
                        return Err(BleError::Unauthorized(reason));
                    }
                    info!("Alternate discovery paired {}, reconnecting", address);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the held device and report the disconnect
    pub fn disconnect(&mut self) {
        if self.release() {
            info!("Disconnected from device");
            self.state_changed.publish(false);
        }
    }

    /// Steps up to a paired, ready handle. Every handle opened here is
    /// either returned or closed.
    async fn open_paired(
        &self,
        address: DeviceAddress,
        cancel: &CancellationToken,
        diagnostics: &mut DiagnosticsBuilder,
    ) -> Result<Arc<dyn BleDevice>, BleError> {
        let device = self.acquire(address, cancel).await?;
        let pairing = device.pairing();
        let initial = pairing.as_deref().map(read_view);

        diagnostics.set_platform_id(
            initial
                .as_ref()
                .map(|view| view.id.clone())
                .unwrap_or_else(|| device.platform_id()),
        );
        diagnostics.set_initial(initial.as_ref());

        let attempt = match ensure_paired(pairing.as_deref(), cancel, diagnostics).await {
            Ok(attempt) => attempt,
            Err(e) => {
                device.close();
                return Err(e);
            }
        };
        diagnostics.record_attempt(&attempt);

        let (device, final_view): (Arc<dyn BleDevice>, Option<PairingView>) =
            if attempt.paired_now() {
                // The pre-pairing handle keeps stale security state
                device.close();
                diagnostics.note("Reopened device handle after pairing.");
                let fresh = self.acquire(address, cancel).await?;
                let view = fresh.pairing().as_deref().map(read_view);
                (fresh, view)
            } else {
                (device, initial)
            };

        diagnostics.set_final(final_view.as_ref());
        diagnostics.set_connection_status(device.connection_status());
        Ok(device)
    }

    async fn pair_via_alternate_discovery(
        &self,
        address: DeviceAddress,
        cancel: &CancellationToken,
        diagnostics: &mut DiagnosticsBuilder,
    ) -> Result<bool, BleError> {
        diagnostics.note("Attempting alternate discovery pairing fallback.");
        let candidates = cancellable(cancel, self.platform.find_pairing_candidates(address)).await?;

        for candidate in candidates {
            let view = read_view(candidate.as_ref());
            diagnostics.note(format!(
                "Alternate candidate {} - IsPaired: {}, CanPair: {}",
                view.id, view.is_paired, view.can_pair
            ));
            if !view.can_pair.is_true() {
                continue;
            }

            diagnostics.set_platform_id(view.id.clone());
            diagnostics.set_initial(Some(&view));

            match ensure_paired(Some(candidate.as_ref()), cancel, diagnostics).await {
                Ok(attempt) => {
                    diagnostics.record_attempt(&attempt);
                    if attempt.paired_now() {
                        diagnostics.note("Alternate discovery fallback paired the device.");
                        return Ok(true);
                    }
                }
                Err(e @ (BleError::PairingFailed(_) | BleError::Unauthorized(_))) => {
                    warn!("Alternate candidate {} did not pair: {}", view.id, e);
                    diagnostics.note(format!("Alternate candidate {} failed: {}", view.id, e));
                }
                Err(e) => return Err(e),
            }
        }

        diagnostics.note("Alternate discovery fallback did not pair the device.");
        Ok(false)
    }

    async fn acquire(
        &self,
        address: DeviceAddress,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn BleDevice>, BleError> {
        cancellable(cancel, self.platform.device_from_address(address))
            .await?
            .ok_or(BleError::NotFound)
    }

    /// Attach the status observer and take ownership of the handle
    fn attach(
        &mut self,
        device: Arc<dyn BleDevice>,
        diagnostics: DiagnosticsBuilder,
    ) -> Result<ConnectionDiagnostics, BleError> {
        let status = device.connection_status();

        let observers = self.state_changed.clone();
        let handler: StatusChangedHandler = Arc::new(move |status: ConnectionStatus| {
            observers.publish(status == ConnectionStatus::Connected);
        });
        let status_token = match device.add_status_handler(handler) {
            Ok(token) => token,
            Err(e) => {
                device.close();
                return Err(e);
            }
        };

        self.state_changed
            .publish(status == ConnectionStatus::Connected);
        *self.shared.lock().unwrap_or_else(PoisonError::into_inner) = Some(device.clone());
        self.held = Some(HeldDevice {
            device,
            status_token,
        });

        info!("Device ready, connection status: {}", status);
        Ok(diagnostics.build())
    }

    /// Detach and close the held handle; returns whether one was held
    fn release(&mut self) -> bool {
        let Some(held) = self.held.take() else {
            return false;
        };
        *self.shared.lock().unwrap_or_else(PoisonError::into_inner) = None;
        held.device.remove_status_handler(held.status_token);
        held.device.close();
        true
    }
}

impl Drop for DeviceConnector {
    fn drop(&mut self) {
        self.release();
    }
}
