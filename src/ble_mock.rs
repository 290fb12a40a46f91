use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::{
    uuids, DiscoveredDevice, DisconnectEvents, NotificationEvents, PlatformGateway,
    PlatformPeripheral,
};
use crate::error::BleError;
use crate::models::DeviceId;

/// Scriptable picker: each `request_device` call consumes the next scripted
/// outcome. An exhausted script fails the scan.
#[derive(Default)]
pub struct MockGateway {
    script: Mutex<VecDeque<Result<Arc<MockPeripheral>, BleError>>>,
    last_filters: Mutex<Vec<Uuid>>,
    requests: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_device(&self, peripheral: Arc<MockPeripheral>) {
        self.script.lock().unwrap().push_back(Ok(peripheral));
    }

    pub fn push_failure(&self, error: BleError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Filters passed to the most recent picker interaction.
    pub fn last_filters(&self) -> Vec<Uuid> {
        self.last_filters.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformGateway for MockGateway {
    async fn request_device(&self, filters: &[Uuid]) -> Result<DiscoveredDevice, BleError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.last_filters.lock().unwrap() = filters.to_vec();
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(peripheral)) => Ok(DiscoveredDevice {
                id: peripheral.id().clone(),
                name: peripheral.name(),
                peripheral,
            }),
            Some(Err(error)) => Err(error),
            None => Err(BleError::ScanFailed {
                reason: "no scripted device".to_string(),
            }),
        }
    }
}

/// A fake peripheral exposing only the battery service.
///
/// Tests drive the platform side through [`MockPeripheral::set_battery_value`],
/// [`MockPeripheral::notify`], [`MockPeripheral::emit_disconnect_event`] and
/// [`MockPeripheral::drop_link`], and observe adapter behaviour through the
/// handshake/read counters.
pub struct MockPeripheral {
    id: DeviceId,
    name: Option<String>,
    connected: AtomicBool,
    battery_value: Mutex<Vec<u8>>,
    battery_service_missing: AtomicBool,
    fail_next_connect: AtomicBool,
    fail_next_subscribe: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    reads: AtomicUsize,
    disconnect_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl MockPeripheral {
    pub fn new(id: &str, name: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            id: DeviceId::from(id),
            name: name.map(str::to_string),
            connected: AtomicBool::new(false),
            battery_value: Mutex::new(Vec::new()),
            battery_service_missing: AtomicBool::new(false),
            fail_next_connect: AtomicBool::new(false),
            fail_next_subscribe: AtomicBool::new(false),
            connect_delay: Mutex::new(None),
            connects: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            disconnect_tx: Mutex::new(None),
            notify_tx: Mutex::new(None),
        })
    }

    pub fn with_battery(id: &str, name: &str, level: u8) -> Arc<Self> {
        let peripheral = Self::new(id, Some(name));
        peripheral.set_battery_value(vec![level]);
        peripheral
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn name(&self) -> Option<String> {
        self.name.clone()
    }

    pub fn set_battery_value(&self, value: Vec<u8>) {
        *self.battery_value.lock().unwrap() = value;
    }

    /// Fire one change notification event. The payload stays on the device;
    /// observers are expected to read the value back.
    pub fn notify(&self) {
        if let Some(tx) = self.notify_tx.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }

    /// Inject a raw disconnect event without tearing the link down.
    pub fn emit_disconnect_event(&self) {
        if let Some(tx) = self.disconnect_tx.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }

    /// Simulate the platform losing the link: the connection state flips,
    /// one disconnect event fires, and both event channels close.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notify_tx.lock().unwrap().take();
        if let Some(tx) = self.disconnect_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    pub fn remove_battery_service(&self) {
        self.battery_service_missing.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_subscribe(&self) {
        self.fail_next_subscribe.store(true, Ordering::SeqCst);
    }

    /// Delay the next handshakes, so tests can overlap connect attempts.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn exposes(&self, service: Uuid, characteristic: Uuid) -> bool {
        service == uuids::BATTERY_SERVICE
            && characteristic == uuids::BATTERY_LEVEL
            && !self.battery_service_missing.load(Ordering::SeqCst)
    }
}

/// Poll `condition` until it holds. Panics if it does not hold within one
/// second; event pumps are expected to settle in a handful of scheduler
/// turns.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within one second");
}

#[async_trait]
impl PlatformPeripheral for MockPeripheral {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<DisconnectEvents, BleError> {
        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(BleError::ConnectionFailed {
                reason: "injected handshake failure".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.disconnect_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.connected.store(false, Ordering::SeqCst);
        self.notify_tx.lock().unwrap().take();
        // The platform reports every disconnect, user-initiated included.
        if let Some(tx) = self.disconnect_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        if !self.is_connected() {
            return Err(BleError::ConnectionFailed {
                reason: "read on a disconnected link".to_string(),
            });
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.exposes(service, characteristic) {
            return Err(BleError::attribute_unavailable(service, characteristic));
        }
        Ok(self.battery_value.lock().unwrap().clone())
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationEvents, BleError> {
        if !self.is_connected() {
            return Err(BleError::ConnectionFailed {
                reason: "subscribe on a disconnected link".to_string(),
            });
        }
        if !self.exposes(service, characteristic) {
            return Err(BleError::attribute_unavailable(service, characteristic));
        }
        if self.fail_next_subscribe.swap(false, Ordering::SeqCst) {
            return Err(BleError::NotificationSetupFailed {
                reason: "injected arming failure".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}
