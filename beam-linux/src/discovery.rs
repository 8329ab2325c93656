//! LAN discovery: the host broadcasts a fixed marker on every IPv4 interface;
//! clients listen for it and learn the host's address from the datagram source.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use beam_core::scheduler::{BEACON_ERROR_BACKOFF, BEACON_INTERVAL};
use beam_core::DISCOVERY_MARKER;
use pnet::datalink;
use pnet::ipnetwork::IpNetwork;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Directed broadcast address of every up, non-loopback IPv4 interface.
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    for iface in datalink::interfaces() {
        if !iface.is_up() || iface.is_loopback() {
            continue;
        }
        for net in &iface.ips {
            if let IpNetwork::V4(v4) = net {
                let bcast = v4.broadcast();
                if !out.contains(&bcast) {
                    out.push(bcast);
                }
            }
        }
    }
    out
}

/// Announce the host every two seconds until the task is dropped.
/// Per-interface send errors are logged and skipped.
pub async fn run_beacon(port: u16) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    info!(port, "discovery beacon started");
    loop {
        let targets = broadcast_addresses();
        if targets.is_empty() {
            warn!("no broadcast-capable interface, backing off");
            tokio::time::sleep(BEACON_ERROR_BACKOFF).await;
            continue;
        }
        for addr in &targets {
            if let Err(e) = socket
                .send_to(DISCOVERY_MARKER.as_bytes(), (*addr, port))
                .await
            {
                debug!(%addr, error = %e, "beacon send failed");
            }
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

/// Lets a manual connect silence discovery.
#[derive(Debug, Default)]
pub struct DiscoveryControl {
    suppressed: AtomicBool,
}

impl DiscoveryControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suppress(&self) {
        self.suppressed.store(true, Ordering::SeqCst);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }
}

/// The host address announced by `payload`, if it is an exact beacon and
/// discovery is not suppressed.
pub fn handle_datagram(payload: &[u8], from: SocketAddr, control: &DiscoveryControl) -> Option<IpAddr> {
    if control.is_suppressed() || payload != DISCOVERY_MARKER.as_bytes() {
        return None;
    }
    Some(from.ip())
}

/// UDP socket on `0.0.0.0:port` that tolerates other listeners on the same port.
pub fn bind_listener(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Receive beacons forever, calling `on_found` with each announcing host.
pub async fn run_listener<F, Fut>(
    socket: UdpSocket,
    control: std::sync::Arc<DiscoveryControl>,
    mut on_found: F,
) -> std::io::Result<()>
where
    F: FnMut(IpAddr) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    info!(addr = %socket.local_addr()?, "listening for hosts");
    let mut buf = [0u8; 512];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if let Some(ip) = handle_datagram(&buf[..n], from, &control) {
            debug!(%ip, "host beacon");
            on_found(ip).await;
        }
    }
}
