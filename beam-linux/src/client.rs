//! Client side: one logical connection to one host, re-established after a
//! fixed delay and re-identified on every connect.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use beam_core::scheduler::{Timer, CONNECT_TIMEOUT, RECONNECT_DELAY};
use beam_core::{DeviceIdentity, StreamHeader};
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{
    self, ConnState, ConnectionError, ConnectionHandler, Link, PeerConnection,
};
use crate::session::Session;

#[derive(Default)]
struct ClientState {
    target: Option<SocketAddr>,
    conn: Option<Arc<PeerConnection>>,
    /// A connect loop is running; further requests only retarget it.
    connecting: bool,
    stopped: bool,
}

pub struct ReconnectingClient {
    me: Weak<ReconnectingClient>,
    session: Session,
    identity: DeviceIdentity,
    timer: Arc<dyn Timer>,
    state: Mutex<ClientState>,
}

impl ReconnectingClient {
    pub fn new(session: Session, identity: DeviceIdentity, timer: Arc<dyn Timer>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session,
            identity,
            timer,
            state: Mutex::new(ClientState::default()),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Connect to `addr` (discovered or entered by hand). Ignored while already
    /// connected to that address; retargets an attempt already in progress.
    pub async fn begin_connecting(&self, addr: SocketAddr) {
        let mut st = self.state.lock().await;
        if st.stopped {
            return;
        }
        if st.connecting {
            if st.target != Some(addr) {
                debug!(%addr, "retargeting connect attempt");
                st.target = Some(addr);
            }
            return;
        }
        if st.target == Some(addr) && st.conn.as_ref().is_some_and(|c| !c.is_closed()) {
            return;
        }
        if let Some(old) = st.conn.take() {
            old.close();
        }
        st.target = Some(addr);
        st.connecting = true;
        drop(st);
        self.spawn_connect_loop(false);
    }

    /// Stop reconnecting and close the live connection.
    pub async fn stop(&self) {
        let conn = {
            let mut st = self.state.lock().await;
            st.stopped = true;
            st.conn.take()
        };
        if let Some(conn) = conn {
            conn.close();
        }
    }

    fn spawn_connect_loop(&self, delay_first: bool) {
        if let Some(this) = self.me.upgrade() {
            tokio::spawn(this.connect_loop(delay_first));
        }
    }

    async fn connect_loop(self: Arc<Self>, mut delay_first: bool) {
        loop {
            if delay_first {
                self.timer.sleep(RECONNECT_DELAY).await;
            }
            delay_first = true;
            let target = {
                let mut st = self.state.lock().await;
                match (st.stopped, st.target) {
                    (false, Some(target)) => target,
                    _ => {
                        st.connecting = false;
                        return;
                    }
                }
            };
            debug!(%target, "connecting");
            let stream = match connection::connect(target, CONNECT_TIMEOUT).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%target, error = %e, "connect failed, retrying");
                    continue;
                }
            };
            match self.establish(stream).await {
                Ok(()) => return,
                Err(e) => warn!(%target, error = %e, "handshake failed, retrying"),
            }
        }
    }

    /// Identify before anything else, then publish the connection and start reading.
    async fn establish(self: &Arc<Self>, stream: TcpStream) -> Result<(), ConnectionError> {
        let (conn, reader) = PeerConnection::new(stream, ConnState::Identifying)?;
        conn.send_envelope(&self.identity.identify_envelope()).await?;
        conn.set_state(ConnState::Active);
        {
            let mut st = self.state.lock().await;
            st.connecting = false;
            if st.stopped {
                conn.close();
                return Ok(());
            }
            if let Some(old) = st.conn.replace(conn.clone()) {
                old.close();
            }
        }
        info!(remote = %conn.remote(), "connected to host");
        self.session
            .events()
            .on_connection_state_changed(conn.remote(), true);
        tokio::spawn(connection::run_read_loop(conn, reader, self.clone()));
        Ok(())
    }
}

#[async_trait]
impl Link for ReconnectingClient {
    async fn connections(&self) -> Vec<Arc<PeerConnection>> {
        let st = self.state.lock().await;
        st.conn.iter().filter(|c| !c.is_closed()).cloned().collect()
    }
}

#[async_trait]
impl ConnectionHandler for ReconnectingClient {
    async fn on_control(&self, conn: &Arc<PeerConnection>, json: String) {
        if let Some(info) = self.session.handle_control(conn, &json).await {
            self.session
                .events()
                .on_device_identified(conn.remote().ip(), &info.device_name);
            conn.set_peer(info);
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
        let reconnect = {
            let mut st = self.state.lock().await;
            let current = st.conn.as_ref().is_some_and(|c| c.id() == conn.id());
            if current {
                st.conn = None;
            }
            let reconnect = current && !st.stopped && !st.connecting;
            if reconnect {
                st.connecting = true;
            }
            reconnect
        };
        self.session
            .events()
            .on_connection_state_changed(conn.remote(), false);
        if reconnect {
            info!(delay = ?RECONNECT_DELAY, "connection lost, reconnecting");
            self.spawn_connect_loop(true);
        }
    }
}
