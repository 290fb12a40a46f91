use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BleError;
use crate::models::DeviceId;

/// Assigned-number UUIDs used by the battery watcher.
pub mod uuids {
    use uuid::Uuid;

    pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
    pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
}

/// Yields one `()` per disconnect event on the link, then closes.
pub type DisconnectEvents = mpsc::UnboundedReceiver<()>;

/// Yields one `()` per characteristic change notification. Closes when the
/// underlying connection drops; the current value is not carried with the
/// event and must be read back.
pub type NotificationEvents = mpsc::UnboundedReceiver<()>;

/// A device surfaced by the platform picker.
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: Option<String>,
    pub peripheral: Arc<dyn PlatformPeripheral>,
}

/// The platform's device-selection capability.
///
/// Implementations wrap whatever the host platform offers (a Web Bluetooth
/// `requestDevice` picker, a CoreBluetooth scan sheet). The adapter is the
/// only caller.
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// Run one device-selection interaction scoped to `filters` (advertised
    /// service UUIDs). Resolves with exactly one device chosen by the user.
    ///
    /// Fails with [`BleError::ScanCancelled`] when the user dismisses the
    /// picker and [`BleError::ScanFailed`] for platform-level errors.
    async fn request_device(&self, filters: &[Uuid]) -> Result<DiscoveredDevice, BleError>;
}

/// GATT operations against one discovered peripheral.
///
/// Implementations translate their native failures into [`BleError`] at this
/// seam: `connect` reports `ConnectionFailed`, `read`/`subscribe` report
/// `AttributeUnavailable` for services or characteristics the device does
/// not expose.
#[async_trait]
pub trait PlatformPeripheral: Send + Sync {
    /// Live connection state of the link.
    fn is_connected(&self) -> bool;

    /// Perform the connection handshake. The returned receiver reports
    /// every disconnect of the link, whoever initiated it.
    async fn connect(&self) -> Result<DisconnectEvents, BleError>;

    async fn disconnect(&self) -> Result<(), BleError>;

    /// Read the current value of `characteristic` under `service`.
    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, BleError>;

    /// Arm change notifications for `characteristic` under `service`.
    /// The subscription lives only as long as the current connection.
    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationEvents, BleError>;
}
