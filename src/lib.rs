pub mod adapter;
pub mod ble;
pub mod ble_mock;
pub mod controller;
pub mod error;
pub mod models;

uniffi::setup_scaffolding!();

pub use adapter::{PeripheralAdapter, Subscription};
pub use ble::{DiscoveredDevice, PlatformGateway, PlatformPeripheral};
pub use controller::{DeviceTable, DeviceTableController};
pub use error::BleError;
pub use models::{battery_percent_from_payload, DeviceId, DeviceRecord};
