use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::adapter::{PeripheralAdapter, Subscription};
use crate::ble::{uuids, PlatformGateway};
use crate::error::BleError;
use crate::models::{battery_percent_from_payload, DeviceId, DeviceRecord};

/// Insertion-ordered collection of known devices.
///
/// Every record in the table was surfaced by an adapter scan; nothing else
/// inserts. Keys are unique; order is kept for display stability.
#[derive(Default)]
pub struct DeviceTable {
    records: Vec<DeviceRecord>,
}

impl DeviceTable {
    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.records.iter().find(|record| &record.id == id)
    }

    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.records.clone()
    }

    fn get_mut(&mut self, id: &DeviceId) -> Option<&mut DeviceRecord> {
        self.records.iter_mut().find(|record| &record.id == id)
    }

    fn connected_ids(&self) -> Vec<DeviceId> {
        self.records
            .iter()
            .filter(|record| record.connected)
            .map(|record| record.id.clone())
            .collect()
    }

    /// Fold one scan result in. A new identifier is appended; a known one
    /// keeps its connection flag and battery reading untouched and may only
    /// gain a display name its first discovery lacked.
    fn merge_discovered(&mut self, id: DeviceId, name: Option<String>) {
        match self.get_mut(&id) {
            Some(record) => {
                if record.display_name.is_none() {
                    record.display_name = name;
                }
            }
            None => self.records.push(DeviceRecord::discovered(id, name)),
        }
    }

    fn set_connected(&mut self, id: &DeviceId, connected: bool) {
        if let Some(record) = self.get_mut(id) {
            record.connected = connected;
        }
    }

    fn set_battery(&mut self, id: &DeviceId, percent: u8) {
        if let Some(record) = self.get_mut(id) {
            record.battery_percent = Some(percent);
        }
    }
}

/// Owns the device table and orchestrates the adapter.
///
/// The three request operations are the whole presentation contract: each
/// resolves without a value, catches every adapter failure, and reports it
/// on the diagnostic channel instead of propagating. The table only ever
/// reflects confirmed transitions, so the UI observes state, not errors.
pub struct DeviceTableController {
    adapter: PeripheralAdapter,
    table: Arc<Mutex<DeviceTable>>,
    connects_in_flight: Mutex<HashSet<DeviceId>>,
    subscriptions: Mutex<HashMap<DeviceId, Subscription>>,
}

impl DeviceTableController {
    pub fn new(adapter: PeripheralAdapter) -> Self {
        Self {
            adapter,
            table: Arc::new(Mutex::new(DeviceTable::default())),
            connects_in_flight: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Controller scanning for battery-service peripherals, the app's
    /// default configuration.
    pub fn with_battery_filter(gateway: Arc<dyn PlatformGateway>) -> Self {
        Self::new(PeripheralAdapter::new(
            gateway,
            vec![uuids::BATTERY_SERVICE],
        ))
    }

    /// Current table contents in insertion order.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.table.lock().unwrap().snapshot()
    }

    /// Disconnect everything, then run one picker interaction and merge the
    /// chosen device into the table. A rescan never regresses known state.
    pub async fn request_scan(&self) {
        self.disconnect_all().await;
        match self.adapter.scan().await {
            Ok((id, name)) => {
                info!(device = %id, name = name.as_deref().unwrap_or("?"), "device discovered");
                self.table.lock().unwrap().merge_discovered(id, name);
            }
            Err(BleError::ScanCancelled) => info!("scan cancelled by the user"),
            Err(error) => warn!(error = %error, "scan failed"),
        }
    }

    /// Connect, prime the battery reading with one read, then keep it fresh
    /// through a standing subscription.
    pub async fn request_connect(&self, id: &DeviceId) {
        if let Err(error) = self.connect_flow(id).await {
            warn!(device = %id, error = %error, "connect request failed");
        }
    }

    /// Tear the connection down and clear the connected flag. The last
    /// battery reading is kept.
    pub async fn request_disconnect(&self, id: &DeviceId) {
        match self.adapter.disconnect(id).await {
            Ok(()) => self.table.lock().unwrap().set_connected(id, false),
            Err(error) => warn!(device = %id, error = %error, "disconnect request failed"),
        }
    }

    /// Sequential on purpose: each failure is attributed to one device and
    /// logged there while the batch carries on.
    async fn disconnect_all(&self) {
        let connected = self.table.lock().unwrap().connected_ids();
        for id in connected {
            self.request_disconnect(&id).await;
        }
    }

    async fn connect_flow(&self, id: &DeviceId) -> Result<(), BleError> {
        if !self.connects_in_flight.lock().unwrap().insert(id.clone()) {
            return Err(BleError::ConnectInProgress { id: id.0.clone() });
        }
        let result = self.connect_stages(id).await;
        self.connects_in_flight.lock().unwrap().remove(id);
        result
    }

    async fn connect_stages(&self, id: &DeviceId) -> Result<(), BleError> {
        let table = Arc::clone(&self.table);
        let device = id.clone();
        self.adapter
            .connect(
                id,
                Box::new(move || {
                    debug!(device = %device, "device disconnected");
                    table.lock().unwrap().set_connected(&device, false);
                }),
            )
            .await?;
        self.table.lock().unwrap().set_connected(id, true);

        // Exactly one priming read. A failure here is logged; it neither
        // rolls back the connected flag nor blocks the subscription.
        match self
            .adapter
            .read_attribute(id, uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
            .await
        {
            Ok(payload) => fold_battery(&self.table, id, payload),
            Err(error) => warn!(device = %id, error = %error, "battery level read failed"),
        }

        let table = Arc::clone(&self.table);
        let device = id.clone();
        let subscription = self
            .adapter
            .subscribe(
                id,
                uuids::BATTERY_SERVICE,
                uuids::BATTERY_LEVEL,
                Box::new(move |payload| fold_battery(&table, &device, payload)),
            )
            .await?;
        if let Some(previous) = self.subscriptions.lock().unwrap().insert(id.clone(), subscription)
        {
            previous.cancel();
        }
        Ok(())
    }
}

fn fold_battery(table: &Mutex<DeviceTable>, id: &DeviceId, payload: Vec<u8>) {
    match battery_percent_from_payload(payload) {
        Some(percent) => table.lock().unwrap().set_battery(id, percent),
        None => warn!(device = %id, "empty battery payload ignored"),
    }
}
