//! Host side: accept loop and the registry of client connections keyed by device ID.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use beam_core::StreamHeader;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::connection::{
    self, ConnId, ConnState, ConnectionHandler, Link, PeerConnection, PeerInfo,
};
use crate::events::EventSink;
use crate::session::Session;

/// Identified clients by device ID, plus sockets that have not sent `identify` yet.
pub struct HostRegistry {
    clients: Mutex<HashMap<String, Arc<PeerConnection>>>,
    unidentified: Mutex<HashMap<ConnId, Arc<PeerConnection>>>,
    events: Arc<dyn EventSink>,
}

impl HostRegistry {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            unidentified: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub async fn add_unidentified(&self, conn: Arc<PeerConnection>) {
        self.unidentified.lock().await.insert(conn.id(), conn);
    }

    /// Bind `conn` to `info.device_id`. An older connection under the same ID
    /// is evicted and closed.
    pub async fn identify(&self, conn: &Arc<PeerConnection>, info: PeerInfo) {
        self.unidentified.lock().await.remove(&conn.id());
        let previous = conn.set_peer(info.clone());
        conn.set_state(ConnState::Active);

        let (evicted, count) = {
            let mut clients = self.clients.lock().await;
            // Re-identifying under a new ID releases the old slot.
            if let Some(prev) = previous.filter(|p| p.device_id != info.device_id) {
                if clients.get(&prev.device_id).is_some_and(|c| c.id() == conn.id()) {
                    clients.remove(&prev.device_id);
                }
            }
            let evicted = clients
                .insert(info.device_id.clone(), conn.clone())
                .filter(|old| old.id() != conn.id());
            (evicted, clients.len())
        };
        if let Some(old) = evicted {
            info!(device = %info.device_id, old = %old.remote(), new = %conn.remote(), "replacing connection");
            old.close();
        }
        self.events
            .on_device_identified(conn.remote().ip(), &info.device_name);
        self.events.on_client_count_changed(count);
    }

    /// Forget `conn`. A newer connection registered under the same device ID stays.
    pub async fn remove(&self, conn: &PeerConnection) {
        self.unidentified.lock().await.remove(&conn.id());
        let Some(device_id) = conn.device_id() else {
            return;
        };
        let count = {
            let mut clients = self.clients.lock().await;
            if !clients.get(&device_id).is_some_and(|c| c.id() == conn.id()) {
                return;
            }
            clients.remove(&device_id);
            clients.len()
        };
        self.events.on_client_count_changed(count);
    }

    #[cfg(test)]
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    #[cfg(test)]
    pub async fn unidentified_count(&self) -> usize {
        self.unidentified.lock().await.len()
    }

    #[cfg(test)]
    pub async fn client(&self, device_id: &str) -> Option<Arc<PeerConnection>> {
        self.clients.lock().await.get(device_id).cloned()
    }

    /// Close every connection, identified or not.
    pub async fn shutdown(&self) {
        let clients: Vec<_> = self.clients.lock().await.values().cloned().collect();
        let pending: Vec<_> = self.unidentified.lock().await.values().cloned().collect();
        for conn in clients.into_iter().chain(pending) {
            conn.close();
        }
    }
}

#[async_trait]
impl Link for HostRegistry {
    async fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.clients
            .lock()
            .await
            .values()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }
}

/// Connection handler for accepted sockets.
pub struct HostHandler {
    session: Session,
    registry: Arc<HostRegistry>,
}

impl HostHandler {
    pub fn new(session: Session, registry: Arc<HostRegistry>) -> Self {
        Self { session, registry }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[async_trait]
impl ConnectionHandler for HostHandler {
    async fn on_control(&self, conn: &Arc<PeerConnection>, json: String) {
        if let Some(info) = self.session.handle_control(conn, &json).await {
            self.registry.identify(conn, info).await;
        }
    }

    async fn on_chunk(&self, conn: &Arc<PeerConnection>, payload: Vec<u8>) {
        self.session.handle_chunk(conn, &payload).await;
    }

    async fn on_stream(
        &self,
        conn: &Arc<PeerConnection>,
        header: StreamHeader,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) {
        self.session.handle_stream(conn, header, body).await;
    }

    async fn on_closed(&self, conn: &Arc<PeerConnection>) {
        self.registry.remove(conn).await;
        self.session
            .events()
            .on_connection_state_changed(conn.remote(), false);
    }
}

/// Accept clients forever. Each socket gets its own read loop.
pub async fn run_host(listener: TcpListener, handler: Arc<HostHandler>) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "host listening");
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let (conn, reader) = match PeerConnection::new(stream, ConnState::Identifying) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(%addr, error = %e, "dropping connection");
                continue;
            }
        };
        handler.registry.add_unidentified(conn.clone()).await;
        handler
            .session
            .events()
            .on_connection_state_changed(conn.remote(), true);
        tokio::spawn(connection::run_read_loop(conn, reader, handler.clone()));
    }
}
