//! Device identity: stable device ID + display name, and message identifiers.

use uuid::Uuid;

use crate::protocol::Envelope;

/// Who this device is on the wire. The ID must stay stable across restarts so the
/// host can replace a stale connection from the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
        }
    }

    /// Fresh identity: `<name>_<uuid>` so IDs stay readable in logs.
    pub fn generate(device_name: impl Into<String>) -> Self {
        let device_name = device_name.into();
        Self {
            device_id: generate_device_id(&device_name),
            device_name,
        }
    }

    /// Handshake envelope sent first on every (re)connect.
    pub fn identify_envelope(&self) -> Envelope {
        Envelope::Identify {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
        }
    }
}

/// Device ID derived from a display name plus a random UUID.
pub fn generate_device_id(device_name: &str) -> String {
    let prefix: String = device_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let prefix = if prefix.is_empty() { "device".to_string() } else { prefix };
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Unique identifier for an outgoing text message.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}
