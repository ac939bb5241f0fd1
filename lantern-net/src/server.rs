//! Viewer-side server: accept loop, peer sessions, fan-out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use lantern_core::identity::{DeviceInfo, PeerId};
use lantern_core::packet::{Packet, PacketCode, PacketEncodeError};
use lantern_core::session::{LogKind, PeerSessions, SessionAction};

use crate::connection::{Connection, ConnectionEvent, ConnectionState, ParseError, SendError};

/// Liveness clock driving `PeerSessions::tick`.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Server-side notifications.
#[derive(Debug)]
pub enum ServerEvent {
    PeerConnected { peer: PeerId, info: DeviceInfo },
    PeerDisconnected { peer: PeerId },
    LogEvent { peer: PeerId, event: serde_json::Value },
    NetworkLogEvent { peer: PeerId, event: serde_json::Value },
    /// Valid frame, unexpected code for the peer's state. The frame was
    /// dropped; the connection stays open.
    ProtocolViolation { peer: PeerId, code: PacketCode },
    /// Frame or body decoding failed on a peer's connection.
    ParseFailed {
        peer: PeerId,
        error: ParseError,
        bytes: Vec<u8>,
    },
    /// One peer could not be reached during a send or broadcast.
    SendFailed { peer: PeerId },
}

/// Outcome of a broadcast: how many peers the frame was handed to and which
/// peers could not be reached.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<PeerId>,
}

/// Error addressing a single peer.
#[derive(Debug, thiserror::Error)]
pub enum ServerSendError {
    #[error("unknown peer")]
    UnknownPeer,
    #[error(transparent)]
    Send(#[from] SendError),
}

struct SessionState {
    sessions: PeerSessions,
    /// Every live connection, including those still pre-hello. The registered
    /// peer set is `sessions`; both are pruned under the same lock.
    conns: HashMap<PeerId, Connection>,
}

struct Shared {
    state: Mutex<SessionState>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

/// Accepts concurrent client connections, tracks established peers, and fans
/// packets out to them.
pub struct LogServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl LogServer {
    /// Bind and start accepting. Returns the server handle and its event
    /// stream.
    pub async fn bind(
        addr: SocketAddr,
    ) -> std::io::Result<(LogServer, mpsc::UnboundedReceiver<ServerEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                sessions: PeerSessions::new(),
                conns: HashMap::new(),
            }),
            events: events_tx,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx.clone()));
        tokio::spawn(tick_loop(shared.clone(), shutdown_rx));
        Ok((
            LogServer {
                shared,
                local_addr,
                shutdown: shutdown_tx,
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of fully established peers.
    pub async fn peer_count(&self) -> usize {
        self.shared.state.lock().await.sessions.peer_count()
    }

    /// Encode once and hand the same bytes to every established peer. One
    /// peer's failure does not block the rest; failures are returned and
    /// also reported as `SendFailed` events.
    pub async fn broadcast(&self, packet: &Packet) -> Result<BroadcastReport, PacketEncodeError> {
        let bytes = packet.encode()?;
        Ok(broadcast_bytes(&self.shared, bytes).await)
    }

    /// Send one packet to one established peer (viewer-initiated pause and
    /// resume go through here).
    pub async fn send_to(&self, peer: PeerId, packet: &Packet) -> Result<(), ServerSendError> {
        let conn = {
            let state = self.shared.state.lock().await;
            if !state.sessions.contains(peer) {
                return Err(ServerSendError::UnknownPeer);
            }
            state.conns.get(&peer).cloned()
        };
        match conn {
            Some(conn) => Ok(conn.send(packet)?),
            None => Err(ServerSendError::UnknownPeer),
        }
    }

    /// Close one peer's connection; the ordinary close path unregisters it.
    pub async fn disconnect(&self, peer: PeerId) {
        let conn = self.shared.state.lock().await.conns.get(&peer).cloned();
        if let Some(conn) = conn {
            conn.cancel();
        }
    }

    /// Stop accepting and close every connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let conns: Vec<Connection> = {
            let state = self.shared.state.lock().await;
            state.conns.values().cloned().collect()
        };
        for conn in conns {
            conn.cancel();
        }
    }
}

async fn broadcast_bytes(shared: &Shared, bytes: Vec<u8>) -> BroadcastReport {
    let targets: Vec<(PeerId, Connection)> = {
        let state = shared.state.lock().await;
        state
            .sessions
            .peer_ids()
            .into_iter()
            .filter_map(|peer| state.conns.get(&peer).map(|conn| (peer, conn.clone())))
            .collect()
    };
    let mut report = BroadcastReport::default();
    for (peer, conn) in targets {
        match conn.send_raw(bytes.clone()) {
            Ok(()) => report.delivered += 1,
            Err(_) => {
                warn!(%peer, "broadcast target unreachable");
                report.failed.push(peer);
                let _ = shared.events.send(ServerEvent::SendFailed { peer });
            }
        }
    }
    report
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accept = tokio::select! {
            _ = shutdown.changed() => break,
            result = listener.accept() => result,
        };
        match accept {
            Ok((stream, addr)) => {
                tokio::spawn(serve_connection(shared.clone(), stream, addr));
            }
            Err(error) => {
                warn!(%error, "accept failed");
                break;
            }
        }
    }
}

async fn tick_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
        }
        let actions = {
            let mut state = shared.state.lock().await;
            state.sessions.tick()
        };
        apply_actions(&shared, actions).await;
    }
}

async fn serve_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let peer = PeerId::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let conn = Connection::from_stream(stream, events_tx);
    {
        let mut state = shared.state.lock().await;
        state.conns.insert(peer, conn.clone());
    }
    debug!(%peer, %addr, "accepted connection");

    while let Some(event) = events_rx.recv().await {
        match event {
            ConnectionEvent::Packet(packet) => {
                let actions = {
                    let mut state = shared.state.lock().await;
                    state.sessions.on_packet(peer, packet)
                };
                apply_actions(&shared, actions).await;
            }
            ConnectionEvent::ParseFailed { error, bytes } => {
                warn!(%peer, %error, "parse failure");
                let _ = shared
                    .events
                    .send(ServerEvent::ParseFailed { peer, error, bytes });
            }
            ConnectionEvent::SendFailed(error) => {
                warn!(%peer, %error, "send failed");
                let _ = shared.events.send(ServerEvent::SendFailed { peer });
            }
            ConnectionEvent::State(ConnectionState::Closed) => break,
            // Terminal conditions surface here; the Closed state follows.
            ConnectionEvent::Completed | ConnectionEvent::Error(_) => {}
            ConnectionEvent::State(_) => {}
        }
    }

    // Prune synchronously with the close notification so broadcasts never
    // target a dead peer.
    let actions = {
        let mut state = shared.state.lock().await;
        state.conns.remove(&peer);
        state.sessions.on_closed(peer)
    };
    apply_actions(&shared, actions).await;
    debug!(%peer, "connection closed");
}

async fn apply_actions(shared: &Shared, actions: Vec<SessionAction>) {
    for action in actions {
        match action {
            SessionAction::Register { peer, info } => {
                let _ = shared.events.send(ServerEvent::PeerConnected { peer, info });
            }
            SessionAction::Reply(peer, packet) => {
                let conn = shared.state.lock().await.conns.get(&peer).cloned();
                if let Some(conn) = conn {
                    if conn.send(&packet).is_err() {
                        let _ = shared.events.send(ServerEvent::SendFailed { peer });
                    }
                }
            }
            SessionAction::Deliver { peer, kind, event } => {
                let event = match kind {
                    LogKind::Message => ServerEvent::LogEvent { peer, event },
                    LogKind::Network => ServerEvent::NetworkLogEvent { peer, event },
                };
                let _ = shared.events.send(event);
            }
            SessionAction::Violation { peer, code } => {
                debug!(%peer, ?code, "protocol violation");
                let _ = shared
                    .events
                    .send(ServerEvent::ProtocolViolation { peer, code });
            }
            SessionAction::Unregister(peer) => {
                let _ = shared.events.send(ServerEvent::PeerDisconnected { peer });
            }
            SessionAction::Expire(peer) => {
                warn!(%peer, "peer silent past timeout, closing");
                let conn = shared.state.lock().await.conns.get(&peer).cloned();
                if let Some(conn) = conn {
                    conn.cancel();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn sample_info(app: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: Uuid::new_v4(),
            device_name: "host".into(),
            app_name: app.into(),
            os_name: "linux".into(),
            os_version: "6.1".into(),
        }
    }

    async fn wait_closed(
        rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        loop {
            let event = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for close")
                .expect("event channel ended");
            if matches!(event, ConnectionEvent::State(ConnectionState::Closed)) {
                return;
            }
        }
    }

    /// Broadcast reaches every live peer and reports the dead one, without
    /// letting the failure block the rest.
    #[tokio::test]
    async fn broadcast_skips_dead_peer_and_reports_it() {
        let (server_events_tx, mut server_events_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            state: Mutex::new(SessionState {
                sessions: PeerSessions::new(),
                conns: HashMap::new(),
            }),
            events: server_events_tx,
        };

        // Two live duplex-backed peers, one peer whose connection is closed.
        let mut live_ends = Vec::new();
        let mut peers = Vec::new();
        for i in 0..2 {
            let (ours, theirs) = tokio::io::duplex(4096);
            let (tx, _rx) = mpsc::unbounded_channel();
            let conn = Connection::from_stream(ours, tx);
            let peer = PeerId::new();
            let mut state = shared.state.lock().await;
            state
                .sessions
                .on_packet(peer, Packet::ClientHello(sample_info(&format!("app-{i}"))));
            state.conns.insert(peer, conn);
            drop(state);
            live_ends.push(theirs);
            peers.push(peer);
        }
        let dead_peer = PeerId::new();
        {
            let (ours, _theirs) = tokio::io::duplex(4096);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let conn = Connection::from_stream(ours, tx);
            let mut state = shared.state.lock().await;
            state
                .sessions
                .on_packet(dead_peer, Packet::ClientHello(sample_info("dead")));
            state.conns.insert(dead_peer, conn.clone());
            drop(state);
            conn.cancel();
            wait_closed(&mut rx).await;
        }

        let bytes = Packet::Pause.encode().unwrap();
        let report = broadcast_bytes(&shared, bytes.clone()).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![dead_peer]);

        // The live ends actually receive the frame.
        use tokio::io::AsyncReadExt;
        for theirs in live_ends.iter_mut() {
            let mut got = vec![0u8; bytes.len()];
            timeout(Duration::from_secs(2), theirs.read_exact(&mut got))
                .await
                .expect("timed out reading broadcast")
                .unwrap();
            assert_eq!(got, bytes);
        }

        // Exactly one per-peer failure event.
        match timeout(Duration::from_secs(2), server_events_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ServerEvent::SendFailed { peer } => assert_eq!(peer, dead_peer),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(server_events_rx.try_recv().is_err());
    }
}
