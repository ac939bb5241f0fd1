//! LAN discovery: UDP multicast advertisement so viewers can be found
//! without a known address. Independent of the stream framing protocol.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Multicast group viewers announce on.
pub const MULTICAST_GROUP: &str = "239.255.81.11";

/// Default UDP port for advertisements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 50505;

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);

/// One service advertisement, sent as a standalone JSON datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub service_id: String,
    pub service_name: String,
    /// Stream listen port the viewer accepts connections on.
    pub port: u16,
}

/// Lifecycle notifications for the advertiser.
#[derive(Debug)]
pub enum DiscoveryEvent {
    Started,
    /// Advertisement withdrawn; `Some` when it stopped on a failure.
    Stopped(Option<std::io::Error>),
}

/// Publishes and withdraws a service advertisement on the local network.
pub struct Advertiser {
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    discovery_port: u16,
    stop: Option<watch::Sender<bool>>,
}

impl Advertiser {
    pub fn new(discovery_port: u16, events: mpsc::UnboundedSender<DiscoveryEvent>) -> Advertiser {
        Advertiser {
            events,
            discovery_port,
            stop: None,
        }
    }

    /// Begin advertising. Reports `Started` once the socket is up, or
    /// `Stopped(Some(error))` if it cannot start. A running advertiser is
    /// restarted with the new advertisement.
    pub fn start(&mut self, ad: Advertisement) {
        self.stop();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.stop = Some(stop_tx);
        let events = self.events.clone();
        let port = self.discovery_port;
        tokio::spawn(async move {
            let socket = match announce_socket() {
                Ok(socket) => socket,
                Err(error) => {
                    let _ = events.send(DiscoveryEvent::Stopped(Some(error)));
                    return;
                }
            };
            let payload = match serde_json::to_vec(&ad) {
                Ok(payload) => payload,
                Err(error) => {
                    let _ = events.send(DiscoveryEvent::Stopped(Some(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        error,
                    ))));
                    return;
                }
            };
            let dest: SocketAddr = match format!("{MULTICAST_GROUP}:{port}").parse() {
                Ok(dest) => dest,
                Err(error) => {
                    let _ = events.send(DiscoveryEvent::Stopped(Some(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        error,
                    ))));
                    return;
                }
            };
            let _ = events.send(DiscoveryEvent::Started);
            loop {
                if let Err(error) = socket.send_to(&payload, dest).await {
                    warn!(%error, "announce failed");
                    let _ = events.send(DiscoveryEvent::Stopped(Some(error)));
                    return;
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {}
                }
            }
            let _ = events.send(DiscoveryEvent::Stopped(None));
        });
    }

    /// Withdraw the advertisement. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Listen on the multicast group and return the first advertisement whose
/// `service_id` matches, with the stream address resolved against the sender
/// IP. `None` on timeout.
pub async fn browse(
    service_id: &str,
    discovery_port: u16,
    wait: Duration,
) -> std::io::Result<Option<(Advertisement, SocketAddr)>> {
    let socket = browse_socket(discovery_port)?;
    let mut buf = vec![0u8; 2048];
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        match received {
            Ok(Ok((n, from))) => match serde_json::from_slice::<Advertisement>(&buf[..n]) {
                Ok(ad) if ad.service_id == service_id => {
                    let addr = SocketAddr::new(from.ip(), ad.port);
                    return Ok(Some((ad, addr)));
                }
                Ok(other) => debug!(service_id = %other.service_id, "ignoring other service"),
                Err(error) => debug!(%error, "ignoring malformed advertisement"),
            },
            Ok(Err(error)) => return Err(error),
            Err(_) => return Ok(None),
        }
    }
}

fn announce_socket() -> std::io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

fn browse_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
    let group: Ipv4Addr = MULTICAST_GROUP
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}
