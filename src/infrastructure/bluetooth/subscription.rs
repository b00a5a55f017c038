//! GATT subscription manager
//!
//! Enables notifications or indications on every characteristic of the
//! connected device that supports them and republishes the values as
//! [`RawMeasurement`]s.

use crate::domain::error::BleError;
use crate::domain::models::{DeviceAddress, RawMeasurement};
use crate::domain::observers::Observers;
use crate::infrastructure::bluetooth::connection::DeviceAccessor;
use crate::infrastructure::bluetooth::platform::{
    cancellable, BleDevice, ClientConfiguration, GattCharacteristic, GattStatus, HandlerToken,
    ValueChangedHandler,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Subscription {
    characteristic: Arc<dyn GattCharacteristic>,
    token: HandlerToken,
}

pub struct SubscriptionManager {
    device: DeviceAccessor,
    subscribed_on: Option<Arc<dyn BleDevice>>,
    subscriptions: Vec<Subscription>,
    measurements: Observers<RawMeasurement>,
    rollback_timeout: Duration,
}

impl SubscriptionManager {
    /// `rollback_timeout` bounds the cleanup after a failed subscribe
    pub fn new(device: DeviceAccessor, rollback_timeout: Duration) -> Self {
        Self {
            device,
            subscribed_on: None,
            subscriptions: Vec::new(),
            measurements: Observers::new(),
            rollback_timeout,
        }
    }

    pub fn measurement_events(&self) -> mpsc::UnboundedReceiver<RawMeasurement> {
        self.measurements.subscribe()
    }

    pub fn is_subscribed(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Enable every notifiable characteristic on the connected device.
    ///
    /// On failure the characteristics enabled so far are disabled again
    /// before the error is returned.
    pub async fn subscribe(
        &mut self,
        address: DeviceAddress,
        cancel: &CancellationToken,
    ) -> Result<(), BleError> {
        let device = (self.device)().ok_or(BleError::NotConnected)?;
        if self.is_subscribed() {
            let same_device = self
                .subscribed_on
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &device));
            if same_device {
                debug!("Already subscribed to {}", address);
                return Ok(());
            }
            info!("Device handle changed, dropping stale subscriptions");
            self.unsubscribe(cancel).await;
        }

        info!("Subscribing to notifications on {}", address);
        if let Err(e) = self.enable_all(device.as_ref(), cancel).await {
            warn!("Subscription failed, rolling back: {}", e);
            self.rollback().await;
            return Err(e);
        }
        self.subscribed_on = Some(device);

        info!(
            "Enabled notifications on {} characteristics",
            self.subscriptions.len()
        );
        Ok(())
    }

    /// Disable every tracked characteristic. Write failures are logged.
    pub async fn unsubscribe(&mut self, cancel: &CancellationToken) {
        self.subscribed_on = None;
        if self.subscriptions.is_empty() {
            return;
        }

        info!(
            "Disabling notifications on {} characteristics",
            self.subscriptions.len()
        );
        // Handlers go first so nothing is published while the writes run
        let characteristics: Vec<_> = std::mem::take(&mut self.subscriptions)
            .into_iter()
            .map(|subscription| {
                subscription
                    .characteristic
                    .remove_value_handler(subscription.token);
                subscription.characteristic
            })
            .collect();

        for characteristic in characteristics {
            match cancellable(
                cancel,
                characteristic.write_client_configuration(ClientConfiguration::None),
            )
            .await
            {
                Ok(GattStatus::Success) => {}
                Ok(status) => warn!(
                    "Disabling {} returned {:?}",
                    characteristic.uuid(),
                    status
                ),
                Err(e) => warn!("Failed to disable {}: {}", characteristic.uuid(), e),
            }
        }
    }

    /// Best-effort unsubscribe after a failure, cut off by `rollback_timeout`
    async fn rollback(&mut self) {
        let cancel = CancellationToken::new();
        let deadline = cancel.clone();
        let timeout = self.rollback_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline.cancel();
        });
        self.unsubscribe(&cancel).await;
        timer.abort();
        if cancel.is_cancelled() {
            warn!("Rollback did not finish within {:?}", timeout);
        }
    }

    async fn enable_all(
        &mut self,
        device: &dyn BleDevice,
        cancel: &CancellationToken,
    ) -> Result<(), BleError> {
        let services = cancellable(cancel, device.gatt_services()).await?;

        for service in services {
            let characteristics = match cancellable(cancel, service.characteristics()).await {
                Ok(characteristics) => characteristics,
                Err(BleError::Canceled) => return Err(BleError::Canceled),
                Err(e) => {
                    warn!("Skipping service {}: {}", service.uuid(), e);
                    continue;
                }
            };

            for characteristic in characteristics {
                let Some(configuration) = characteristic.properties().subscription_kind() else {
                    continue;
                };
                self.enable(characteristic, configuration, cancel).await?;
            }
        }

        Ok(())
    }

    async fn enable(
        &mut self,
        characteristic: Arc<dyn GattCharacteristic>,
        configuration: ClientConfiguration,
        cancel: &CancellationToken,
    ) -> Result<(), BleError> {
        let status = cancellable(
            cancel,
            characteristic.write_client_configuration(configuration),
        )
        .await?;
        if status != GattStatus::Success {
            warn!(
                "Skipping characteristic {}: CCCD write returned {:?}",
                characteristic.uuid(),
                status
            );
            return Ok(());
        }

        let service_id = characteristic.service_uuid();
        let characteristic_id = characteristic.uuid();
        let observers = self.measurements.clone();
        let handler: ValueChangedHandler = Arc::new(move |bytes: Vec<u8>| {
            debug!("{} notified {} bytes", characteristic_id, bytes.len());
            observers.publish(RawMeasurement::new(
                Utc::now(),
                service_id,
                characteristic_id,
                bytes,
            ));
        });

        let token = match characteristic.add_value_handler(handler) {
            Ok(token) => token,
            Err(e) => {
                match cancellable(
                    cancel,
                    characteristic.write_client_configuration(ClientConfiguration::None),
                )
                .await
                {
                    Ok(GattStatus::Success) => {}
                    Ok(status) => warn!(
                        "Disabling {} after handler failure returned {:?}",
                        characteristic_id, status
                    ),
                    Err(disable_error) => warn!(
                        "Failed to disable {} after handler failure: {}",
                        characteristic_id, disable_error
                    ),
                }
                return Err(e);
            }
        };

        debug!("Enabled {:?} on {}", configuration, characteristic_id);
        self.subscriptions.push(Subscription {
            characteristic,
            token,
        });
        Ok(())
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription
                .characteristic
                .remove_value_handler(subscription.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fakes::{FakeCharacteristic, FakeDevice, FakeService};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn gatt_id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn address() -> DeviceAddress {
        DeviceAddress::new(0xA1B2_C3D4_E5F6).unwrap()
    }

    fn device(services: Vec<Arc<FakeService>>) -> Arc<FakeDevice> {
        Arc::new(FakeDevice {
            id: "dev".to_string(),
            pairing: None,
            status: Mutex::new(crate::domain::models::ConnectionStatus::Connected),
            services,
            closed: AtomicUsize::new(0),
            status_handlers: Mutex::new(HashMap::new()),
        })
    }

    fn manager_for(device: Option<Arc<FakeDevice>>) -> SubscriptionManager {
        let device = device.map(|d| d as Arc<dyn BleDevice>);
        SubscriptionManager::new(
            Arc::new(move || device.clone()),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_subscribe_without_device_is_not_connected() {
        let mut manager = manager_for(None);
        let result = manager.subscribe(address(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(BleError::NotConnected)));
    }

    #[tokio::test]
    async fn test_enables_notify_and_indicate_and_publishes() {
        let notify = FakeCharacteristic::new(gatt_id(1), gatt_id(10), true, true);
        let indicate = FakeCharacteristic::new(gatt_id(1), gatt_id(11), false, true);
        let plain = FakeCharacteristic::new(gatt_id(1), gatt_id(12), false, false);
        let service = FakeService::new(
            gatt_id(1),
            vec![notify.clone(), indicate.clone(), plain.clone()],
        );
        let mut manager = manager_for(Some(device(vec![service])));
        let mut measurements = manager.measurement_events();

        manager
            .subscribe(address(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manager.subscribed_count(), 2);
        assert_eq!(notify.writes(), vec![ClientConfiguration::Notify]);
        assert_eq!(indicate.writes(), vec![ClientConfiguration::Indicate]);
        assert!(plain.writes().is_empty());

        notify.emit(&[1, 2, 3]);
        indicate.emit(&[]);
        let first = measurements.try_recv().unwrap();
        assert_eq!(first.service_id, gatt_id(1));
        assert_eq!(first.characteristic_id, gatt_id(10));
        assert_eq!(&*first.payload, &[1, 2, 3]);
        let second = measurements.try_recv().unwrap();
        assert!(second.payload.is_empty());
    }

    #[tokio::test]
    async fn test_failed_service_and_bad_status_are_skipped() {
        let rejected = FakeCharacteristic::new(gatt_id(2), gatt_id(20), true, false);
        *rejected.status.lock().unwrap() = GattStatus::AccessDenied;
        let good = FakeCharacteristic::new(gatt_id(3), gatt_id(30), true, false);
        let mut manager = manager_for(Some(device(vec![
            FakeService::failing(gatt_id(1)),
            FakeService::new(gatt_id(2), vec![rejected.clone()]),
            FakeService::new(gatt_id(3), vec![good.clone()]),
        ])));

        manager
            .subscribe(address(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manager.subscribed_count(), 1);
        assert_eq!(rejected.handler_count(), 0);
        assert_eq!(good.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_rolls_back_enabled_characteristics() {
        let first = FakeCharacteristic::new(gatt_id(1), gatt_id(10), true, false);
        let stuck = FakeCharacteristic::new(gatt_id(1), gatt_id(11), true, false);
        stuck.hang_on_enable.store(true, Ordering::SeqCst);
        let mut manager = manager_for(Some(device(vec![FakeService::new(
            gatt_id(1),
            vec![first.clone(), stuck.clone()],
        )])));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = manager.subscribe(address(), &cancel).await;

        assert!(matches!(result, Err(BleError::Canceled)));
        assert!(!manager.is_subscribed());
        assert_eq!(
            first.writes(),
            vec![ClientConfiguration::Notify, ClientConfiguration::None]
        );
        assert_eq!(first.handler_count(), 0);
        assert_eq!(stuck.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice() {
        let characteristic = FakeCharacteristic::new(gatt_id(1), gatt_id(10), true, false);
        let mut manager = manager_for(Some(device(vec![FakeService::new(
            gatt_id(1),
            vec![characteristic.clone()],
        )])));
        let cancel = CancellationToken::new();
        manager.subscribe(address(), &cancel).await.unwrap();

        manager.unsubscribe(&cancel).await;
        manager.unsubscribe(&cancel).await;

        assert!(!manager.is_subscribed());
        assert_eq!(characteristic.handlers_removed.load(Ordering::SeqCst), 1);
        assert_eq!(
            characteristic.writes(),
            vec![ClientConfiguration::Notify, ClientConfiguration::None]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_clears_tracking_on_write_failure() {
        let characteristic = FakeCharacteristic::new(gatt_id(1), gatt_id(10), true, false);
        let mut manager = manager_for(Some(device(vec![FakeService::new(
            gatt_id(1),
            vec![characteristic.clone()],
        )])));
        let cancel = CancellationToken::new();
        manager.subscribe(address(), &cancel).await.unwrap();
        *characteristic.status.lock().unwrap() = GattStatus::Unreachable;

        manager.unsubscribe(&cancel).await;

        assert_eq!(manager.subscribed_count(), 0);
        assert_eq!(characteristic.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_is_bounded_when_disable_hangs() {
        let first = FakeCharacteristic::new(gatt_id(1), gatt_id(10), true, false);
        first.hang_on_disable.store(true, Ordering::SeqCst);
        let stuck = FakeCharacteristic::new(gatt_id(1), gatt_id(11), true, false);
        stuck.hang_on_enable.store(true, Ordering::SeqCst);
        let mut manager = manager_for(Some(device(vec![FakeService::new(
            gatt_id(1),
            vec![first.clone(), stuck],
        )])));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            manager.subscribe(address(), &cancel),
        )
        .await
        .expect("subscribe did not return after cancellation");

        assert!(matches!(result, Err(BleError::Canceled)));
        assert!(!manager.is_subscribed());
        assert_eq!(first.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_new_device_handle_replaces_stale_subscriptions() {
        let old_char = FakeCharacteristic::new(gatt_id(1), gatt_id(10), true, false);
        let new_char = FakeCharacteristic::new(gatt_id(1), gatt_id(10), true, false);
        let old_device = device(vec![FakeService::new(gatt_id(1), vec![old_char.clone()])]);
        let new_device = device(vec![FakeService::new(gatt_id(1), vec![new_char.clone()])]);

        let current: Arc<Mutex<Option<Arc<dyn BleDevice>>>> =
            Arc::new(Mutex::new(Some(old_device as Arc<dyn BleDevice>)));
        let shared = current.clone();
        let mut manager = SubscriptionManager::new(
            Arc::new(move || shared.lock().unwrap().clone()),
            Duration::from_millis(100),
        );
        let cancel = CancellationToken::new();

        manager.subscribe(address(), &cancel).await.unwrap();
        manager.subscribe(address(), &cancel).await.unwrap();
        assert_eq!(old_char.writes(), vec![ClientConfiguration::Notify]);

        *current.lock().unwrap() = Some(new_device as Arc<dyn BleDevice>);
        manager.subscribe(address(), &cancel).await.unwrap();

        assert_eq!(
            old_char.writes(),
            vec![ClientConfiguration::Notify, ClientConfiguration::None]
        );
        assert_eq!(old_char.handler_count(), 0);
        assert_eq!(new_char.writes(), vec![ClientConfiguration::Notify]);
        assert_eq!(new_char.handler_count(), 1);
        assert_eq!(manager.subscribed_count(), 1);
    }
}
