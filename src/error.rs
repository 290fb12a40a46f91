use thiserror::Error;

/// Error type for peripheral adapter operations.
///
/// The adapter raises these to the controller; the controller catches every
/// one, emits a diagnostic, and never lets them reach the presentation layer.
#[derive(Error, Debug, Clone, PartialEq, Eq, uniffi::Error)]
#[uniffi(flat_error)]
pub enum BleError {
    #[error("scan cancelled by the user")]
    ScanCancelled,

    #[error("scan failed: {reason}")]
    ScanFailed { reason: String },

    #[error("unknown device: {id}")]
    UnknownDevice { id: String },

    #[error("connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("attribute {characteristic} on service {service} is not available")]
    AttributeUnavailable {
        service: String,
        characteristic: String,
    },

    #[error("notification setup failed: {reason}")]
    NotificationSetupFailed { reason: String },

    #[error("a connect attempt for {id} is already in flight")]
    ConnectInProgress { id: String },
}

impl BleError {
    pub fn unknown_device(id: &crate::models::DeviceId) -> Self {
        BleError::UnknownDevice { id: id.0.clone() }
    }

    pub fn attribute_unavailable(service: uuid::Uuid, characteristic: uuid::Uuid) -> Self {
        BleError::AttributeUnavailable {
            service: service.to_string(),
            characteristic: characteristic.to_string(),
        }
    }
}
