//! Beam wire protocol: well-known ports, the discovery marker and control envelopes.

use serde::{Deserialize, Serialize};

use crate::wire::{Frame, FrameEncodeError};

/// UDP port for host beacons.
pub const DISCOVERY_PORT: u16 = 8888;
/// TCP port for control and data.
pub const TRANSPORT_PORT: u16 = 8081;
/// Literal beacon payload broadcast by the host.
pub const DISCOVERY_MARKER: &str = "I_AM_THE_HOST";

/// Receipt status for an acknowledged text or file.
pub const STATUS_DELIVERED: &str = "delivered";
/// Receipt status for a file that arrived but failed verification.
pub const STATUS_FAILED: &str = "failed";
/// `file_complete` status for a file written on this side.
pub const STATUS_RECEIVED: &str = "received";

const DEFAULT_DEVICE_NAME: &str = "Phone";

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

/// Control envelope carried in kind-0 frames, tagged by `type`.
/// Unknown fields are ignored; unknown `type` values decode to `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First message on every connection; binds the socket to a device.
    #[serde(rename_all = "camelCase")]
    Identify {
        #[serde(default)]
        device_id: String,
        #[serde(default = "default_device_name")]
        device_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Text {
        #[serde(default)]
        content: String,
        #[serde(default)]
        message_id: String,
        #[serde(default)]
        sender_id: String,
    },
    /// Ack for a text (`messageId`) or a received file (`fileName`).
    #[serde(rename_all = "camelCase")]
    DeliveryReceipt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default)]
        status: String,
    },
    /// Synthesized by a stream receiver before any file bytes are written.
    #[serde(alias = "file_metadata", rename_all = "camelCase")]
    StreamStart {
        name: String,
        #[serde(default)]
        size: u64,
        #[serde(default)]
        sender_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    /// Expected SHA-256 (hex) of a file about to arrive in chunks.
    FileDigest { name: String, sha256: String },
    #[serde(other)]
    Unknown,
}

impl Envelope {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Encode as a control frame.
    pub fn to_frame(&self) -> Result<Frame, FrameEncodeError> {
        Ok(Frame::Control(self.to_json()?))
    }

    pub fn message_receipt(message_id: impl Into<String>) -> Self {
        Envelope::DeliveryReceipt {
            message_id: Some(message_id.into()),
            file_name: None,
            status: STATUS_DELIVERED.to_string(),
        }
    }

    pub fn file_receipt(file_name: impl Into<String>) -> Self {
        Envelope::DeliveryReceipt {
            message_id: None,
            file_name: Some(file_name.into()),
            status: STATUS_DELIVERED.to_string(),
        }
    }

    /// Receipt for a file kept on disk whose digest did not match.
    pub fn file_failed_receipt(file_name: impl Into<String>) -> Self {
        Envelope::DeliveryReceipt {
            message_id: None,
            file_name: Some(file_name.into()),
            status: STATUS_FAILED.to_string(),
        }
    }

    /// Value of the `type` field this envelope serializes with.
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Identify { .. } => "identify",
            Envelope::Text { .. } => "text",
            Envelope::DeliveryReceipt { .. } => "delivery_receipt",
            Envelope::StreamStart { .. } => "stream_start",
            Envelope::FileComplete { .. } => "file_complete",
            Envelope::FileDigest { .. } => "file_digest",
            Envelope::Unknown => "unknown",
        }
    }
}
