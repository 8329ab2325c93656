//! Host-driven API: BeamCore receives decoded control messages and local
//! send/receive events, and returns actions for the host to perform.

use crate::delivery::{DeliveryStatus, DeliveryTracker, TrackingKey};
use crate::identity::{self, DeviceIdentity};
use crate::integrity::ExpectedDigests;
use crate::protocol::{Envelope, STATUS_FAILED};

/// Protocol state for one device. Holds no sockets or files.
pub struct BeamCore {
    identity: DeviceIdentity,
    deliveries: DeliveryTracker,
    expected_digests: ExpectedDigests,
}

impl BeamCore {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            deliveries: DeliveryTracker::new(),
            expected_digests: ExpectedDigests::new(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Build an outgoing text with a fresh message ID and start tracking it.
    pub fn prepare_text(&mut self, content: &str) -> Envelope {
        self.prepare_text_with_id(content, identity::new_message_id())
    }

    pub fn prepare_text_with_id(&mut self, content: &str, message_id: String) -> Envelope {
        self.deliveries
            .track(TrackingKey::Message(message_id.clone()));
        Envelope::Text {
            content: content.to_string(),
            message_id,
            sender_id: self.identity.device_id.clone(),
        }
    }

    /// Start tracking an outgoing file by name.
    pub fn track_file(&mut self, name: &str) -> Action {
        let key = TrackingKey::File(name.to_string());
        self.deliveries.track(key.clone());
        Action::StatusChanged {
            key,
            status: DeliveryStatus::Sending,
        }
    }

    /// Local write of a text or file finished.
    pub fn mark_sent(&mut self, key: &TrackingKey) -> Option<Action> {
        self.transition(key, DeliveryStatus::Sent)
    }

    /// Give up on a send (chunk retries exhausted, unreadable source).
    pub fn mark_failed(&mut self, key: &TrackingKey) -> Option<Action> {
        self.transition(key, DeliveryStatus::Failed)
    }

    pub fn status(&self, key: &TrackingKey) -> Option<DeliveryStatus> {
        self.deliveries.status(key)
    }

    pub fn pending_deliveries(&self) -> usize {
        self.deliveries.pending()
    }

    fn transition(&mut self, key: &TrackingKey, next: DeliveryStatus) -> Option<Action> {
        self.deliveries
            .advance(key, next)
            .map(|status| Action::StatusChanged {
                key: key.clone(),
                status,
            })
    }

    /// Process one control-frame payload from a peer.
    pub fn on_control_received(&mut self, json: &str) -> Result<Vec<Action>, MessageError> {
        let envelope = Envelope::from_json(json)?;
        Ok(self.on_envelope(envelope))
    }

    pub fn on_envelope(&mut self, envelope: Envelope) -> Vec<Action> {
        match envelope {
            Envelope::Identify {
                device_id,
                device_name,
            } => vec![Action::Identified {
                device_id,
                device_name,
            }],
            Envelope::Text { ref message_id, .. } => {
                let mut actions = Vec::with_capacity(2);
                if !message_id.is_empty() {
                    actions.push(Action::Reply(Envelope::message_receipt(message_id.clone())));
                }
                actions.push(Action::Deliver(envelope));
                actions
            }
            Envelope::DeliveryReceipt {
                ref message_id,
                ref file_name,
                ref status,
            } => {
                let key = match (message_id, file_name) {
                    (Some(id), _) => TrackingKey::Message(id.clone()),
                    (None, Some(name)) => TrackingKey::File(name.clone()),
                    (None, None) => return Vec::new(),
                };
                self.deliveries
                    .on_receipt(&key, status != STATUS_FAILED)
                    .map(|status| Action::StatusChanged { key, status })
                    .into_iter()
                    .collect()
            }
            Envelope::FileDigest { name, sha256 } => {
                self.expected_digests.insert(name, sha256);
                Vec::new()
            }
            Envelope::StreamStart { .. } | Envelope::FileComplete { .. } => {
                vec![Action::Deliver(envelope)]
            }
            Envelope::Unknown => Vec::new(),
        }
    }

    /// Synthesized `stream_start` for a stream-open header, before any bytes are written.
    pub fn stream_started(&self, name: &str, size: u64, sender_id: &str) -> Envelope {
        Envelope::StreamStart {
            name: name.to_string(),
            size,
            sender_id: sender_id.to_string(),
        }
    }

    /// A file finished on this side (all stream bytes or all chunks on disk).
    /// Chunked files with an announced digest are verified first; the receipt
    /// waits for `on_file_verified`.
    pub fn on_file_received(&mut self, name: &str, path: &str) -> Vec<Action> {
        if let Some(expected_sha256) = self.expected_digests.take(name) {
            return vec![Action::VerifyFile {
                name: name.to_string(),
                path: path.to_string(),
                expected_sha256,
            }];
        }
        self.file_accepted(name, path)
    }

    /// Result of a `VerifyFile` action.
    pub fn on_file_verified(&mut self, name: &str, path: &str, ok: bool) -> Vec<Action> {
        if ok {
            self.file_accepted(name, path)
        } else {
            vec![
                Action::Rejected {
                    name: name.to_string(),
                    path: path.to_string(),
                },
                Action::Reply(Envelope::file_failed_receipt(name)),
            ]
        }
    }

    fn file_accepted(&self, name: &str, path: &str) -> Vec<Action> {
        vec![
            Action::FileAccepted {
                name: name.to_string(),
                path: path.to_string(),
            },
            Action::Reply(Envelope::file_receipt(name)),
        ]
    }
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send this envelope back to the peer that sent the triggering message.
    Reply(Envelope),
    /// Hand this envelope to the application.
    Deliver(Envelope),
    /// Peer announced its identity; bind the connection to `device_id`.
    Identified {
        device_id: String,
        device_name: String,
    },
    /// Delivery status of an outgoing text or file changed.
    StatusChanged {
        key: TrackingKey,
        status: DeliveryStatus,
    },
    /// A received file is final at `path`.
    FileAccepted { name: String, path: String },
    /// Hash the file at `path` and report back with `on_file_verified`.
    VerifyFile {
        name: String,
        path: String,
        expected_sha256: String,
    },
    /// File failed verification and stays at `path`; a `failed` receipt follows.
    Rejected { name: String, path: String },
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),
}
