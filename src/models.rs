/// Opaque, platform-assigned identifier for a peripheral. Stable for the
/// lifetime of the application session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

uniffi::custom_newtype!(DeviceId, String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId(value.to_string())
    }
}

/// One row of the device table as the presentation layer sees it.
///
/// `battery_percent` is the last known reading; it is not cleared when the
/// device disconnects.
#[derive(Clone, Debug, PartialEq, Eq, uniffi::Record)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub display_name: Option<String>,
    pub connected: bool,
    pub battery_percent: Option<u8>,
}

impl DeviceRecord {
    pub fn discovered(id: DeviceId, display_name: Option<String>) -> Self {
        Self {
            id,
            display_name,
            connected: false,
            battery_percent: None,
        }
    }
}

/// Decode a Battery Level characteristic payload.
///
/// The level is the first byte of the value. The Battery Service defines the
/// range as 0-100; out-of-range bytes clamp to 100. Empty payloads decode to
/// `None`.
#[uniffi::export]
pub fn battery_percent_from_payload(payload: Vec<u8>) -> Option<u8> {
    payload.first().map(|&level| level.min(100))
}
