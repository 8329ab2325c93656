//! Outgoing texts and files over whichever `Link` this process has: the host
//! registry (broadcast to all clients) or the client's single connection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use beam_core::delivery::{DeliveryStatus, TrackingKey};
use beam_core::progress::ProgressTracker;
use beam_core::scheduler::{RetryPolicy, Timer, CONNECTION_POLL_INTERVAL};
use beam_core::{Action, BeamCore, Envelope, Frame, FrameEncodeError};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::connection::Link;
use crate::events::{safe_file_name, EventSink};
use crate::files::{self, TransferError};
use crate::session::Session;

/// How a file goes over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Stream-open header followed by raw bytes, to every connection.
    Stream,
    /// Digest announcement, then 256 KiB chunks with bounded retries.
    Chunked,
}

#[derive(Clone)]
pub struct Messenger {
    link: Arc<dyn Link>,
    core: Arc<Mutex<BeamCore>>,
    events: Arc<dyn EventSink>,
    timer: Arc<dyn Timer>,
}

impl Messenger {
    pub fn new(link: Arc<dyn Link>, session: &Session, timer: Arc<dyn Timer>) -> Self {
        Self {
            link,
            core: session.core().clone(),
            events: session.events().clone(),
            timer,
        }
    }

    /// Queue a text. It is retried until a connection accepts it; the
    /// returned message ID is what the receipt will carry.
    pub async fn send_text(&self, content: &str) -> Result<String, FrameEncodeError> {
        let envelope = self.core.lock().await.prepare_text(content);
        let message_id = match &envelope {
            Envelope::Text { message_id, .. } => message_id.clone(),
            _ => String::new(),
        };
        let key = TrackingKey::Message(message_id.clone());
        self.events
            .on_delivery_status(&key, DeliveryStatus::Sending);
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                let failed = self.core.lock().await.mark_failed(&key);
                self.report(failed);
                return Err(e);
            }
        };
        let this = self.clone();
        tokio::spawn(async move { this.deliver_text(key, frame).await });
        Ok(message_id)
    }

    async fn deliver_text(&self, key: TrackingKey, frame: Frame) {
        loop {
            while !self.link.is_connected().await {
                self.timer.sleep(CONNECTION_POLL_INTERVAL).await;
            }
            match files::send_with_retry(
                self.link.as_ref(),
                self.timer.as_ref(),
                &frame,
                RetryPolicy::for_text(),
            )
            .await
            {
                Ok(n) => {
                    debug!(%key, connections = n, "text written");
                    break;
                }
                Err(e) => debug!(%key, error = %e, "text not sent yet"),
            }
        }
        let sent = self.core.lock().await.mark_sent(&key);
        self.report(sent);
    }

    /// Start sending the file at `path`. Returns the name it travels under.
    /// Failures after this point surface as a `failed` delivery status.
    pub async fn send_file(&self, path: &Path, mode: FileMode) -> Result<String, TransferError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(safe_file_name)
            .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?;
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(TransferError::InvalidName(path.display().to_string()));
        }
        let tracking = self.core.lock().await.track_file(&name);
        self.report(Some(tracking));

        let this = self.clone();
        let path = path.to_path_buf();
        let task_name = name.clone();
        tokio::spawn(async move { this.deliver_file(path, task_name, mode).await });
        Ok(name)
    }

    async fn deliver_file(&self, path: PathBuf, name: String, mode: FileMode) {
        let result = match mode {
            FileMode::Stream => self.stream_to_all(&path, &name).await,
            FileMode::Chunked => {
                let events = self.events.clone();
                let progress_name = name.clone();
                files::send_chunked_file(
                    self.link.as_ref(),
                    self.timer.as_ref(),
                    &path,
                    &name,
                    move |p| events.on_send_progress(&progress_name, p),
                )
                .await
                .map(|chunks| debug!(file = %name, chunks, "all chunks written"))
            }
        };
        let key = TrackingKey::File(name.clone());
        let action = match result {
            Ok(()) => {
                info!(file = %name, ?mode, "file sent");
                self.core.lock().await.mark_sent(&key)
            }
            Err(e) => {
                warn!(file = %name, ?mode, error = %e, "file send failed");
                self.core.lock().await.mark_failed(&key)
            }
        };
        self.report(action);
    }

    /// Stream to every live connection at once. Progress is over the bytes
    /// of all recipients together; succeeds if any recipient got the whole file.
    async fn stream_to_all(&self, path: &Path, name: &str) -> Result<(), TransferError> {
        let conns = self.link.connections().await;
        if conns.is_empty() {
            return Err(TransferError::NotConnected);
        }
        let size = tokio::fs::metadata(path).await?.len();
        let total = size * conns.len() as u64;
        let done = Arc::new(AtomicU64::new(0));
        let tracker = Arc::new(StdMutex::new(ProgressTracker::new()));

        let mut set = JoinSet::new();
        for conn in conns {
            let path = path.to_path_buf();
            let name = name.to_string();
            let progress_name = name.clone();
            let events = self.events.clone();
            let done = done.clone();
            let tracker = tracker.clone();
            set.spawn(async move {
                let mut last = 0u64;
                let progress = move |n: u64| {
                    let delta = n - last;
                    last = n;
                    let so_far = done.fetch_add(delta, Ordering::SeqCst) + delta;
                    let update = tracker
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .update(so_far, total);
                    if let Some(p) = update {
                        events.on_send_progress(&progress_name, p);
                    }
                };
                let res = files::send_stream_file(&conn, &path, &name, progress).await;
                (conn.remote(), res)
            });
        }

        let mut delivered = 0usize;
        let mut last_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(_))) => delivered += 1,
                Ok((remote, Err(e))) => {
                    warn!(file = name, %remote, error = %e, "stream to peer failed");
                    last_err = Some(e);
                }
                Err(e) => warn!(file = name, error = %e, "stream task panicked"),
            }
        }
        match (delivered, last_err) {
            (0, Some(e)) => Err(e),
            (0, None) => Err(TransferError::NotConnected),
            _ => Ok(()),
        }
    }

    /// Outgoing texts and files still waiting for a receipt.
    pub async fn pending(&self) -> usize {
        self.core.lock().await.pending_deliveries()
    }

    /// Live connections a send would go to right now.
    pub async fn connection_count(&self) -> usize {
        self.link.connections().await.len()
    }

    fn report(&self, action: Option<Action>) {
        if let Some(Action::StatusChanged { key, status }) = action {
            self.events.on_delivery_status(&key, status);
        }
    }
}
