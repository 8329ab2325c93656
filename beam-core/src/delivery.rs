//! Delivery tracking for outgoing texts and files: sending -> sent -> delivered/failed.

use std::collections::HashMap;
use std::fmt;

/// Delivery state of one outgoing text or file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is allowed. A receipt may arrive
    /// before the local write completes, so `Delivered` is reachable from any
    /// open state. `Failed` comes from a local failure or a failure receipt.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match (self, next) {
            (Delivered | Failed, _) => false,
            (_, Delivered) => true,
            (Sending, Sent) | (Sending, Failed) | (Sent, Failed) => true,
            _ => false,
        }
    }

    /// No further transitions; the tracker forgets the entry.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a status belongs to: a text by message ID or a file by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackingKey {
    Message(String),
    File(String),
}

impl fmt::Display for TrackingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingKey::Message(id) => write!(f, "message {}", id),
            TrackingKey::File(name) => write!(f, "file {}", name),
        }
    }
}

/// Status table for everything this side has sent.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    entries: HashMap<TrackingKey, DeliveryStatus>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `key` in `Sending`. Re-tracking a file name resets it
    /// (the same file may be sent again).
    pub fn track(&mut self, key: TrackingKey) {
        self.entries.insert(key, DeliveryStatus::Sending);
    }

    /// Move `key` to `next`; returns the new status if it changed. Entries
    /// reaching a terminal status are dropped, so later updates are ignored.
    pub fn advance(&mut self, key: &TrackingKey, next: DeliveryStatus) -> Option<DeliveryStatus> {
        let current = self.entries.get_mut(key)?;
        if !current.can_advance_to(next) {
            return None;
        }
        if next.is_terminal() {
            self.entries.remove(key);
        } else {
            *current = next;
        }
        Some(next)
    }

    /// Apply a `delivery_receipt` carrying `delivered` (`ok`) or `failed`.
    /// Unknown keys are ignored.
    pub fn on_receipt(&mut self, key: &TrackingKey, ok: bool) -> Option<DeliveryStatus> {
        let next = if ok {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Failed
        };
        self.advance(key, next)
    }

    pub fn status(&self, key: &TrackingKey) -> Option<DeliveryStatus> {
        self.entries.get(key).copied()
    }

    /// Count of entries still waiting on the network (sending or sent).
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
