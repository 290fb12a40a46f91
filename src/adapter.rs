use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ble::{PlatformGateway, PlatformPeripheral};
use crate::error::BleError;
use crate::models::DeviceId;

type DisconnectListener = Arc<dyn Fn() + Send + Sync>;

/// Handle to a standing characteristic subscription.
///
/// The pump keeps running when the handle is dropped; it stops when the
/// underlying connection drops or when [`Subscription::cancel`] is called.
#[derive(Debug)]
pub struct Subscription {
    pump: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        self.pump.abort();
    }

    /// True once the pump has ended, e.g. after the link dropped.
    pub fn is_finished(&self) -> bool {
        self.pump.is_finished()
    }
}

/// Wraps the platform peripheral API behind the five operations the
/// controller needs, and owns the cache of discovered device handles.
///
/// Handles are cached on first discovery and retained for the process
/// lifetime; disconnecting never evicts them, so reconnection stays
/// possible. One adapter instance is constructed explicitly and handed to
/// the controller; there is no ambient singleton.
pub struct PeripheralAdapter {
    gateway: Arc<dyn PlatformGateway>,
    filters: Vec<Uuid>,
    cache: Mutex<HashMap<DeviceId, Arc<dyn PlatformPeripheral>>>,
    listeners: Arc<Mutex<HashMap<DeviceId, DisconnectListener>>>,
}

impl PeripheralAdapter {
    /// `filters` scopes every picker interaction to devices advertising the
    /// given services.
    pub fn new(gateway: Arc<dyn PlatformGateway>, filters: Vec<Uuid>) -> Self {
        Self {
            gateway,
            filters,
            cache: Mutex::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one platform device-selection interaction. Resolves with the
    /// single device the user chose and caches its handle; re-discovering an
    /// already-cached identifier leaves the cache untouched but still
    /// returns the identifier and name.
    pub async fn scan(&self) -> Result<(DeviceId, Option<String>), BleError> {
        let discovered = self.gateway.request_device(&self.filters).await?;
        let mut cache = self.cache.lock().unwrap();
        cache
            .entry(discovered.id.clone())
            .or_insert_with(|| Arc::clone(&discovered.peripheral));
        Ok((discovered.id, discovered.name))
    }

    /// Live platform connection state. Unknown identifiers are simply not
    /// connected; this never fails.
    pub fn is_connected(&self, id: &DeviceId) -> bool {
        match self.cache.lock().unwrap().get(id) {
            Some(peripheral) => peripheral.is_connected(),
            None => false,
        }
    }

    /// Connect to a previously discovered device. `on_unexpected_disconnect`
    /// is invoked exactly once per disconnect event on the link, including
    /// disconnects this adapter did not initiate. No-op when the link is
    /// already up (the listener is still replaced). A failed handshake
    /// leaves the listener registry as it was.
    pub async fn connect(
        &self,
        id: &DeviceId,
        on_unexpected_disconnect: Box<dyn Fn() + Send + Sync>,
    ) -> Result<(), BleError> {
        let peripheral = self.peripheral(id)?;
        let previous = self
            .listeners
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::from(on_unexpected_disconnect));
        if let Err(error) = self.ensure_connected(id, &peripheral).await {
            let mut listeners = self.listeners.lock().unwrap();
            match previous {
                Some(previous) => {
                    listeners.insert(id.clone(), previous);
                }
                None => {
                    listeners.remove(id);
                }
            }
            return Err(error);
        }
        Ok(())
    }

    /// Tear the connection down. No-op for unknown or already-disconnected
    /// identifiers; the cached handle is kept.
    pub async fn disconnect(&self, id: &DeviceId) -> Result<(), BleError> {
        let peripheral = match self.cache.lock().unwrap().get(id) {
            Some(peripheral) => Arc::clone(peripheral),
            None => return Ok(()),
        };
        if !peripheral.is_connected() {
            return Ok(());
        }
        peripheral.disconnect().await
    }

    /// Read the current value of an attribute, reconnecting first if the
    /// link is down.
    pub async fn read_attribute(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleError> {
        let peripheral = self.peripheral(id)?;
        self.ensure_connected(id, &peripheral).await?;
        peripheral.read(service, characteristic).await
    }

    /// Arm change notifications, reconnecting first if the link is down.
    /// `on_change` receives the attribute's current value once per
    /// notification, re-read at event time: platforms are not trusted to
    /// deliver events with an already-current payload.
    ///
    /// The subscription ends silently with the connection; re-subscribing
    /// after a reconnect is the caller's responsibility.
    pub async fn subscribe(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        on_change: Box<dyn Fn(Vec<u8>) + Send + Sync>,
    ) -> Result<Subscription, BleError> {
        let peripheral = self.peripheral(id)?;
        self.ensure_connected(id, &peripheral).await?;
        let mut events = match peripheral.subscribe(service, characteristic).await {
            Ok(events) => events,
            Err(error @ BleError::AttributeUnavailable { .. }) => return Err(error),
            Err(error @ BleError::NotificationSetupFailed { .. }) => return Err(error),
            Err(error) => {
                return Err(BleError::NotificationSetupFailed {
                    reason: error.to_string(),
                })
            }
        };
        let device = id.clone();
        let pump = tokio::spawn(async move {
            while events.recv().await.is_some() {
                match peripheral.read(service, characteristic).await {
                    Ok(payload) => on_change(payload),
                    Err(error) => {
                        warn!(device = %device, error = %error, "value refresh after notification failed")
                    }
                }
            }
            debug!(device = %device, "notification stream ended");
        });
        Ok(Subscription { pump })
    }

    fn peripheral(&self, id: &DeviceId) -> Result<Arc<dyn PlatformPeripheral>, BleError> {
        self.cache
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| BleError::unknown_device(id))
    }

    /// Precondition repair shared by connect/read/subscribe: perform the
    /// handshake when the link is down and arm a watcher that forwards every
    /// disconnect event to the registered listener.
    async fn ensure_connected(
        &self,
        id: &DeviceId,
        peripheral: &Arc<dyn PlatformPeripheral>,
    ) -> Result<(), BleError> {
        if peripheral.is_connected() {
            return Ok(());
        }
        let mut events = peripheral.connect().await?;
        let listeners = Arc::clone(&self.listeners);
        let device = id.clone();
        tokio::spawn(async move {
            while events.recv().await.is_some() {
                let listener = listeners.lock().unwrap().get(&device).cloned();
                match listener {
                    Some(listener) => listener(),
                    None => debug!(device = %device, "disconnect event with no listener"),
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids;
    use crate::ble_mock::{eventually, MockGateway, MockPeripheral};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn adapter_with(gateway: MockGateway) -> PeripheralAdapter {
        PeripheralAdapter::new(Arc::new(gateway), vec![uuids::BATTERY_SERVICE])
    }

    fn collector() -> (Box<dyn Fn(Vec<u8>) + Send + Sync>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (
            Box::new(move |payload| sink.lock().unwrap().push(payload)),
            seen,
        )
    }

    #[tokio::test]
    async fn test_scan_caches_first_handle() {
        let gateway = Arc::new(MockGateway::new());
        let first = MockPeripheral::with_battery("AA:BB", "Sensor1", 1);
        let second = MockPeripheral::with_battery("AA:BB", "Sensor1", 9);
        gateway.push_device(Arc::clone(&first));
        gateway.push_device(second);
        let handle: Arc<dyn PlatformGateway> = Arc::clone(&gateway) as Arc<dyn PlatformGateway>;
        let adapter = PeripheralAdapter::new(handle, vec![uuids::BATTERY_SERVICE]);

        let (id, name) = adapter.scan().await.unwrap();
        assert_eq!(id, DeviceId::from("AA:BB"));
        assert_eq!(name.as_deref(), Some("Sensor1"));

        // Re-discovery still resolves but must not replace the cached handle.
        let (id, _) = adapter.scan().await.unwrap();
        let value = adapter
            .read_attribute(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
            .await
            .unwrap();
        assert_eq!(value, vec![1]);
        assert_eq!(first.connect_count(), 1);
        assert_eq!(gateway.request_count(), 2);
    }

    #[tokio::test]
    async fn test_scan_passes_filters_and_failures_through() {
        let gateway = MockGateway::new();
        gateway.push_failure(BleError::ScanCancelled);
        let adapter = PeripheralAdapter::new(Arc::new(gateway), vec![uuids::BATTERY_SERVICE]);
        assert_eq!(adapter.scan().await, Err(BleError::ScanCancelled));
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_connected_and_rejected() {
        let adapter = adapter_with(MockGateway::new());
        let id = DeviceId::from("no:such");
        assert!(!adapter.is_connected(&id));
        let err = adapter.connect(&id, Box::new(|| {})).await.unwrap_err();
        assert_eq!(
            err,
            BleError::UnknownDevice {
                id: "no:such".to_string()
            }
        );
        let err = adapter
            .read_attribute(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
            .await
            .unwrap_err();
        assert!(matches!(err, BleError::UnknownDevice { .. }));
    }

    #[tokio::test]
    async fn test_connect_is_noop_when_already_connected() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 80);
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        adapter.connect(&id, Box::new(|| {})).await.unwrap();
        adapter.connect(&id, Box::new(|| {})).await.unwrap();
        assert_eq!(peripheral.connect_count(), 1);
        assert!(adapter.is_connected(&id));
    }

    #[tokio::test]
    async fn test_disconnect_is_noop_for_unknown_or_idle() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 80);
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);

        adapter.disconnect(&DeviceId::from("no:such")).await.unwrap();

        let (id, _) = adapter.scan().await.unwrap();
        adapter.disconnect(&id).await.unwrap();
        assert_eq!(peripheral.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_listener_fires_once_per_event() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 80);
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        adapter
            .connect(&id, Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        peripheral.emit_disconnect_event();
        eventually(|| fired.load(Ordering::SeqCst) == 1).await;
        peripheral.emit_disconnect_event();
        eventually(|| fired.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn test_connection_failure_surfaces() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 80);
        peripheral.fail_next_connect();
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        let err = adapter.connect(&id, Box::new(|| {})).await.unwrap_err();
        assert!(matches!(err, BleError::ConnectionFailed { .. }));
        assert!(!adapter.is_connected(&id));

        // The failure is not sticky; a retry succeeds.
        adapter.connect(&id, Box::new(|| {})).await.unwrap();
        assert!(adapter.is_connected(&id));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_listener_registered() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 80);
        peripheral.fail_next_connect();
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let err = adapter
            .connect(&id, Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, BleError::ConnectionFailed { .. }));

        // A later transparent reconnect arms the watcher; the rejected
        // callback must not have stayed behind.
        adapter
            .read_attribute(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
            .await
            .unwrap();
        peripheral.emit_disconnect_event();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_reconnect_keeps_the_previous_listener() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 80);
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        adapter
            .connect(&id, Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        peripheral.drop_link();
        eventually(|| fired.load(Ordering::SeqCst) == 1).await;

        peripheral.fail_next_connect();
        let err = adapter.connect(&id, Box::new(|| {})).await.unwrap_err();
        assert!(matches!(err, BleError::ConnectionFailed { .. }));

        adapter
            .read_attribute(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
            .await
            .unwrap();
        peripheral.emit_disconnect_event();
        eventually(|| fired.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn test_read_repairs_a_dropped_link() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 0x5A);
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        // Never connected: the read performs the handshake itself.
        let value = adapter
            .read_attribute(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
            .await
            .unwrap();
        assert_eq!(value, vec![0x5A]);
        assert_eq!(peripheral.connect_count(), 1);

        peripheral.drop_link();
        let value = adapter
            .read_attribute(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
            .await
            .unwrap();
        assert_eq!(value, vec![0x5A]);
        assert_eq!(peripheral.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_read_reports_missing_attribute() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 80);
        peripheral.remove_battery_service();
        gateway.push_device(peripheral);
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        let err = adapter
            .read_attribute(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
            .await
            .unwrap_err();
        assert!(matches!(err, BleError::AttributeUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_rereads_current_value_per_event() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 0x32);
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        let (on_change, seen) = collector();
        let _subscription = adapter
            .subscribe(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL, on_change)
            .await
            .unwrap();

        peripheral.notify();
        eventually(|| seen.lock().unwrap().len() == 1).await;
        peripheral.set_battery_value(vec![0x1E]);
        peripheral.notify();
        eventually(|| seen.lock().unwrap().len() == 2).await;
        assert_eq!(*seen.lock().unwrap(), vec![vec![0x32], vec![0x1E]]);
        // One fresh read per event, none besides.
        assert_eq!(peripheral.read_count(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_survives_handle_drop_but_not_cancel() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 0x32);
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        let (on_change, seen) = collector();
        let subscription = adapter
            .subscribe(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL, on_change)
            .await
            .unwrap();
        subscription.cancel();
        peripheral.notify();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());

        let (on_change, seen) = collector();
        let subscription = adapter
            .subscribe(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL, on_change)
            .await
            .unwrap();
        drop(subscription);
        peripheral.notify();
        eventually(|| seen.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn test_subscription_ends_with_the_connection() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 0x32);
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        let (on_change, _seen) = collector();
        let subscription = adapter
            .subscribe(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL, on_change)
            .await
            .unwrap();
        peripheral.drop_link();
        eventually(|| subscription.is_finished()).await;
    }

    #[tokio::test]
    async fn test_subscribe_failure_classification() {
        let gateway = MockGateway::new();
        let peripheral = MockPeripheral::with_battery("AA:BB", "Sensor1", 80);
        gateway.push_device(Arc::clone(&peripheral));
        let adapter = adapter_with(gateway);
        let (id, _) = adapter.scan().await.unwrap();

        peripheral.fail_next_subscribe();
        let (on_change, _) = collector();
        let err = adapter
            .subscribe(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL, on_change)
            .await
            .unwrap_err();
        assert!(matches!(err, BleError::NotificationSetupFailed { .. }));

        peripheral.remove_battery_service();
        let (on_change, _) = collector();
        let err = adapter
            .subscribe(&id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL, on_change)
            .await
            .unwrap_err();
        assert!(matches!(err, BleError::AttributeUnavailable { .. }));
    }
}
