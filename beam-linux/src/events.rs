//! Callbacks out of the transport (`EventSink`) and the destination resolver
//! for incoming files (`OutputResolver`). The daemon's implementations log.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use beam_core::delivery::{DeliveryStatus, TrackingKey};
use beam_core::Envelope;
use tracing::{info, warn};

/// Notifications from the transport. Called synchronously on the connection
/// tasks; implementations marshal to their own thread if they need to.
pub trait EventSink: Send + Sync {
    fn on_text_message(&self, from: SocketAddr, envelope: &Envelope);
    /// Control envelopes other than text (`stream_start`/`file_complete` sent by a peer).
    fn on_envelope(&self, _from: SocketAddr, _envelope: &Envelope) {}
    fn on_file_started(&self, name: &str, size: u64, sender: &str);
    fn on_file_progress(&self, name: &str, percent: u8);
    fn on_file_complete(&self, name: &str, path: &Path);
    /// A received file failed its digest check. It stays at `path`.
    fn on_file_rejected(&self, name: &str, path: &Path);
    /// Outgoing transfer progress.
    fn on_send_progress(&self, _name: &str, _percent: u8) {}
    fn on_connection_state_changed(&self, peer: SocketAddr, connected: bool);
    fn on_device_identified(&self, ip: IpAddr, name: &str);
    fn on_delivery_status(&self, key: &TrackingKey, status: DeliveryStatus);
    fn on_client_count_changed(&self, _count: usize) {}
}

/// Where an incoming file is written.
pub trait OutputResolver: Send + Sync {
    fn resolve_output(&self, file_name: &str) -> io::Result<PathBuf>;
}

/// Writes incoming files into one directory, created on demand.
#[derive(Debug, Clone)]
pub struct DownloadDir {
    root: PathBuf,
}

impl DownloadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl OutputResolver for DownloadDir {
    fn resolve_output(&self, file_name: &str) -> io::Result<PathBuf> {
        let name = safe_file_name(file_name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unusable file name {:?}", file_name),
            )
        })?;
        std::fs::create_dir_all(&self.root)?;
        Ok(self.root.join(name))
    }
}

/// Final path component of a peer-supplied name; `None` if nothing usable remains.
pub fn safe_file_name(name: &str) -> Option<String> {
    // Peers may send Windows paths.
    let last = name.rsplit(&['/', '\\'][..]).next()?;
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    match cleaned.as_str() {
        "" | "." | ".." => None,
        _ => Some(cleaned),
    }
}

/// Reports every event as a log line.
pub struct LogEvents;

impl EventSink for LogEvents {
    fn on_text_message(&self, from: SocketAddr, envelope: &Envelope) {
        if let Envelope::Text {
            content, sender_id, ..
        } = envelope
        {
            info!(%from, sender = %sender_id, "message: {}", content);
        }
    }

    fn on_envelope(&self, from: SocketAddr, envelope: &Envelope) {
        info!(%from, kind = envelope.type_name(), "peer event");
    }

    fn on_file_started(&self, name: &str, size: u64, sender: &str) {
        info!(file = name, size, sender, "incoming file");
    }

    fn on_file_progress(&self, name: &str, percent: u8) {
        info!(file = name, percent, "receiving");
    }

    fn on_file_complete(&self, name: &str, path: &Path) {
        info!(file = name, path = %path.display(), "file received");
    }

    fn on_file_rejected(&self, name: &str, path: &Path) {
        warn!(file = name, path = %path.display(), "digest mismatch, file kept");
    }

    fn on_send_progress(&self, name: &str, percent: u8) {
        info!(file = name, percent, "sending");
    }

    fn on_connection_state_changed(&self, peer: SocketAddr, connected: bool) {
        if connected {
            info!(%peer, "connected");
        } else {
            warn!(%peer, "disconnected");
        }
    }

    fn on_device_identified(&self, ip: IpAddr, name: &str) {
        info!(%ip, device = name, "device identified");
    }

    fn on_delivery_status(&self, key: &TrackingKey, status: DeliveryStatus) {
        info!(%key, %status, "delivery status");
    }

    fn on_client_count_changed(&self, count: usize) {
        info!(count, "clients connected");
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording sink for tests: every callback becomes an `Event` on a channel.

    use super::*;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Text { from: SocketAddr, content: String },
        Envelope(Envelope),
        FileStarted { name: String, size: u64, sender: String },
        FileProgress { name: String, percent: u8 },
        FileComplete { name: String, path: PathBuf },
        FileRejected { name: String, path: PathBuf },
        SendProgress { name: String, percent: u8 },
        Connection { peer: SocketAddr, connected: bool },
        Identified { ip: IpAddr, name: String },
        Delivery { key: TrackingKey, status: DeliveryStatus },
        ClientCount(usize),
    }

    pub struct RecordingEvents {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl RecordingEvents {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { tx }, rx)
        }

        fn push(&self, event: Event) {
            let _ = self.tx.send(event);
        }
    }

    impl EventSink for RecordingEvents {
        fn on_text_message(&self, from: SocketAddr, envelope: &Envelope) {
            if let Envelope::Text { content, .. } = envelope {
                self.push(Event::Text {
                    from,
                    content: content.clone(),
                });
            }
        }

        fn on_envelope(&self, _from: SocketAddr, envelope: &Envelope) {
            self.push(Event::Envelope(envelope.clone()));
        }

        fn on_file_started(&self, name: &str, size: u64, sender: &str) {
            self.push(Event::FileStarted {
                name: name.into(),
                size,
                sender: sender.into(),
            });
        }

        fn on_file_progress(&self, name: &str, percent: u8) {
            self.push(Event::FileProgress {
                name: name.into(),
                percent,
            });
        }

        fn on_file_complete(&self, name: &str, path: &Path) {
            self.push(Event::FileComplete {
                name: name.into(),
                path: path.to_path_buf(),
            });
        }

        fn on_file_rejected(&self, name: &str, path: &Path) {
            self.push(Event::FileRejected {
                name: name.into(),
                path: path.to_path_buf(),
            });
        }

        fn on_send_progress(&self, name: &str, percent: u8) {
            self.push(Event::SendProgress {
                name: name.into(),
                percent,
            });
        }

        fn on_connection_state_changed(&self, peer: SocketAddr, connected: bool) {
            self.push(Event::Connection { peer, connected });
        }

        fn on_device_identified(&self, ip: IpAddr, name: &str) {
            self.push(Event::Identified {
                ip,
                name: name.into(),
            });
        }

        fn on_delivery_status(&self, key: &TrackingKey, status: DeliveryStatus) {
            self.push(Event::Delivery {
                key: key.clone(),
                status,
            });
        }

        fn on_client_count_changed(&self, count: usize) {
            self.push(Event::ClientCount(count));
        }
    }

    /// Wait (up to 10 s of runtime time) for the first event matching `pred`,
    /// discarding the ones before it.
    pub async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<Event>, mut pred: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        let found = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while let Some(ev) = rx.recv().await {
                if pred(&ev) {
                    return Some(ev);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(ev)) => ev,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}
