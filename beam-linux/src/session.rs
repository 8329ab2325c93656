//! Glue between connections and `BeamCore`: feeds decoded frames to the core
//! and performs the actions it returns. Shared by host and client handlers.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use beam_core::integrity;
use beam_core::scheduler::Timer;
use beam_core::{Action, BeamCore, Envelope, StreamHeader};
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{PeerConnection, PeerInfo};
use crate::events::{EventSink, OutputResolver};
use crate::files::{self, ChunkOutcome, ChunkReceiver, StreamOutcome};

/// Production timer: the runtime's sleep.
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

pub struct Session {
    core: Arc<Mutex<BeamCore>>,
    events: Arc<dyn EventSink>,
    resolver: Arc<dyn OutputResolver>,
    chunks: ChunkReceiver,
}

impl Session {
    pub fn new(
        core: Arc<Mutex<BeamCore>>,
        events: Arc<dyn EventSink>,
        resolver: Arc<dyn OutputResolver>,
    ) -> Self {
        Self {
            core,
            events,
            chunks: ChunkReceiver::new(resolver.clone()),
            resolver,
        }
    }

    pub fn core(&self) -> &Arc<Mutex<BeamCore>> {
        &self.core
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Handle a control frame. Returns the identity if the peer sent `identify`;
    /// binding it is up to the caller's role.
    pub async fn handle_control(&self, conn: &Arc<PeerConnection>, json: &str) -> Option<PeerInfo> {
        let actions = match self.core.lock().await.on_control_received(json) {
            Ok(actions) => actions,
            Err(e) => {
                warn!(remote = %conn.remote(), error = %e, "ignoring malformed control message");
                return None;
            }
        };
        self.apply(conn, actions).await
    }

    pub async fn handle_chunk(&self, conn: &Arc<PeerConnection>, payload: &[u8]) {
        let (header, outcome) = match self.chunks.receive(payload).await {
            Ok(r) => r,
            Err(e) => {
                warn!(remote = %conn.remote(), error = %e, "chunk rejected");
                return;
            }
        };
        match outcome {
            ChunkOutcome::Duplicate => {}
            ChunkOutcome::InProgress { progress } => {
                if let Some(p) = progress {
                    self.events.on_file_progress(&header.name, p);
                }
            }
            ChunkOutcome::Complete { path, progress } => {
                if let Some(p) = progress {
                    self.events.on_file_progress(&header.name, p);
                }
                self.file_received(conn, &header.name, &path).await;
            }
        }
    }

    pub async fn handle_stream(
        &self,
        conn: &Arc<PeerConnection>,
        header: StreamHeader,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) {
        let sender = conn
            .peer()
            .map(|p| p.device_name)
            .unwrap_or_else(|| conn.remote().ip().to_string());
        let start = self
            .core
            .lock()
            .await
            .stream_started(&header.name, header.size, &sender);
        if let Envelope::StreamStart { name, size, sender_id } = &start {
            self.events.on_file_started(name, *size, sender_id);
        }

        let events = self.events.clone();
        let name = header.name.clone();
        let outcome = files::receive_stream(self.resolver.as_ref(), &header, body, |p| {
            events.on_file_progress(&name, p)
        })
        .await;
        match outcome {
            Ok(StreamOutcome::Complete(path)) => self.file_received(conn, &header.name, &path).await,
            Ok(StreamOutcome::Truncated { received }) => {
                warn!(file = %header.name, received, expected = header.size, "stream ended early");
            }
            Err(e) => {
                warn!(file = %header.name, error = %e, "stream abandoned");
            }
        }
    }

    async fn file_received(&self, conn: &Arc<PeerConnection>, name: &str, path: &Path) {
        let path_str = path.to_string_lossy();
        let actions = self.core.lock().await.on_file_received(name, &path_str);
        self.apply(conn, actions).await;
    }

    /// Perform core actions in order. Verification results feed back into the queue.
    pub async fn apply(&self, conn: &Arc<PeerConnection>, actions: Vec<Action>) -> Option<PeerInfo> {
        let mut identified = None;
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Reply(envelope) => {
                    if let Err(e) = conn.send_envelope(&envelope).await {
                        debug!(remote = %conn.remote(), kind = envelope.type_name(), error = %e, "reply not sent");
                    }
                }
                Action::Deliver(envelope) => match envelope {
                    Envelope::Text { .. } => self.events.on_text_message(conn.remote(), &envelope),
                    _ => self.events.on_envelope(conn.remote(), &envelope),
                },
                Action::Identified {
                    device_id,
                    device_name,
                } => {
                    identified = Some(PeerInfo {
                        device_id,
                        device_name,
                    });
                }
                Action::StatusChanged { key, status } => {
                    self.events.on_delivery_status(&key, status);
                }
                Action::FileAccepted { name, path } => {
                    self.events.on_file_complete(&name, Path::new(&path));
                }
                Action::VerifyFile {
                    name,
                    path,
                    expected_sha256,
                } => {
                    let ok = match files::hash_file(Path::new(&path)).await {
                        Ok(actual) => integrity::digests_match(&actual, &expected_sha256),
                        Err(e) => {
                            warn!(file = %name, error = %e, "could not hash received file");
                            false
                        }
                    };
                    if ok {
                        info!(file = %name, "digest verified");
                    }
                    let next = self.core.lock().await.on_file_verified(&name, &path, ok);
                    queue.extend(next);
                }
                Action::Rejected { name, path } => {
                    self.events.on_file_rejected(&name, Path::new(&path));
                }
            }
        }
        identified
    }
}
