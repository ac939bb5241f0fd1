//! Client handle: hello-first connect, pause/resume gating, periodic pings.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use lantern_core::identity::DeviceInfo;
use lantern_core::packet::Packet;

use crate::connection::{Connection, ConnectionEvent, ConnectionState};

/// Liveness ping cadence. Must stay comfortably under the viewer's silence
/// timeout.
const PING_INTERVAL: Duration = Duration::from_secs(2);

/// Notifications for the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Viewer acknowledged the hello.
    Established,
    Paused,
    Resumed,
    /// Connection ended (completed, transport error, or local close).
    Disconnected,
}

/// Error shipping an event.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("client closed")]
    Closed,
}

enum Ctl {
    Log(serde_json::Value),
    Network(serde_json::Value),
    Ping,
}

/// SDK-side handle to one viewer connection. The hello is the first packet on
/// the wire; everything the caller submits queues behind it in order.
pub struct LogClient {
    ctl: mpsc::UnboundedSender<Ctl>,
    conn: Connection,
}

impl LogClient {
    /// Dial a viewer and perform the hello handshake.
    pub fn connect(
        addr: SocketAddr,
        info: DeviceInfo,
    ) -> (LogClient, mpsc::UnboundedReceiver<ClientEvent>) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let conn = Connection::connect(addr, conn_tx);
        LogClient::start(conn, conn_rx, info)
    }

    /// Attach to an established stream (tests, alternate transports).
    pub fn from_stream<S>(
        stream: S,
        info: DeviceInfo,
    ) -> (LogClient, mpsc::UnboundedReceiver<ClientEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let conn = Connection::from_stream(stream, conn_tx);
        LogClient::start(conn, conn_rx, info)
    }

    fn start(
        conn: Connection,
        conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        info: DeviceInfo,
    ) -> (LogClient, mpsc::UnboundedReceiver<ClientEvent>) {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        if let Err(error) = conn.send(&Packet::ClientHello(info)) {
            debug!(%error, "hello not queued");
        }
        tokio::spawn(client_loop(conn.clone(), conn_rx, ctl_rx, event_tx));
        (LogClient { ctl: ctl_tx, conn }, event_rx)
    }

    /// Ship one log event. While paused, events queue in memory and flush in
    /// order on resume.
    pub fn log<T: Serialize>(&self, event: &T) -> Result<(), ClientError> {
        let value = serde_json::to_value(event)?;
        self.ctl.send(Ctl::Log(value)).map_err(|_| ClientError::Closed)
    }

    /// Ship one network log event.
    pub fn log_network<T: Serialize>(&self, event: &T) -> Result<(), ClientError> {
        let value = serde_json::to_value(event)?;
        self.ctl
            .send(Ctl::Network(value))
            .map_err(|_| ClientError::Closed)
    }

    /// Send an immediate liveness ping (one is also sent periodically).
    pub fn ping(&self) -> Result<(), ClientError> {
        self.ctl.send(Ctl::Ping).map_err(|_| ClientError::Closed)
    }

    /// Close the connection. Queued but unsent events are dropped.
    pub fn close(&self) {
        self.conn.cancel();
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }
}

async fn client_loop(
    conn: Connection,
    mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut ctl_rx: mpsc::UnboundedReceiver<Ctl>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut paused = false;
    let mut queue: VecDeque<Packet> = VecDeque::new();
    let mut ctl_open = true;
    let start = tokio::time::Instant::now() + PING_INTERVAL;
    let mut ping = tokio::time::interval_at(start, PING_INTERVAL);
    loop {
        tokio::select! {
            ctl = ctl_rx.recv(), if ctl_open => match ctl {
                Some(ctl) => {
                    let packet = match ctl {
                        Ctl::Log(value) => Packet::LogMessage(value),
                        Ctl::Network(value) => Packet::LogNetworkMessage(value),
                        Ctl::Ping => Packet::Ping,
                    };
                    if paused && !matches!(packet, Packet::Ping) {
                        queue.push_back(packet);
                    } else if let Err(error) = conn.send(&packet) {
                        debug!(%error, "send failed");
                    }
                }
                None => {
                    // Handle dropped; close and drain the connection events.
                    ctl_open = false;
                    conn.cancel();
                }
            },
            _ = ping.tick() => {
                let _ = conn.send(&Packet::Ping);
            }
            event = conn_rx.recv() => match event {
                Some(ConnectionEvent::Packet(Packet::Pause)) => {
                    paused = true;
                    let _ = events.send(ClientEvent::Paused);
                }
                Some(ConnectionEvent::Packet(Packet::Resume)) => {
                    paused = false;
                    while let Some(packet) = queue.pop_front() {
                        if conn.send(&packet).is_err() {
                            break;
                        }
                    }
                    let _ = events.send(ClientEvent::Resumed);
                }
                Some(ConnectionEvent::Packet(Packet::ServerHello)) => {
                    let _ = events.send(ClientEvent::Established);
                }
                Some(ConnectionEvent::Packet(other)) => {
                    debug!(code = ?other.code(), "unexpected packet at client, dropped");
                }
                Some(ConnectionEvent::State(ConnectionState::Closed)) => {
                    let _ = events.send(ClientEvent::Disconnected);
                    return;
                }
                Some(_) => {}
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lantern_core::identity::{DeviceInfoProvider, HostInfoProvider};
    use lantern_core::reassembly::Reassembler;
    use lantern_core::Frame;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    fn sample_info() -> DeviceInfo {
        HostInfoProvider::new("client-test").device_info()
    }

    /// Read until `want` non-ping frames arrive (the periodic ping may
    /// interleave with anything).
    async fn read_frames(stream: &mut DuplexStream, reassembler: &mut Reassembler, want: usize) -> Vec<Frame> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 4096];
        while out.len() < want {
            let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("timed out reading frames")
                .unwrap();
            assert!(n > 0, "stream ended early");
            reassembler.push(&buf[..n], &mut out).unwrap();
            out.retain(|frame| frame.code != lantern_core::PacketCode::Ping);
        }
        out
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("client event channel ended")
    }

    #[tokio::test]
    async fn hello_precedes_everything() {
        let (ours, mut viewer) = tokio::io::duplex(4096);
        let (client, _events) = LogClient::from_stream(ours, sample_info());
        client.log(&json!({"msg": "first"})).unwrap();

        let mut reassembler = Reassembler::new();
        let frames = read_frames(&mut viewer, &mut reassembler, 2).await;
        let hello = Packet::decode(&frames[0]).unwrap();
        match hello {
            Packet::ClientHello(info) => assert_eq!(info.app_name, "client-test"),
            other => panic!("expected hello first, got {other:?}"),
        }
        match Packet::decode(&frames[1]).unwrap() {
            Packet::LogMessage(value) => assert_eq!(value, json!({"msg": "first"})),
            other => panic!("expected log message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_hello_establishes() {
        let (ours, mut viewer) = tokio::io::duplex(4096);
        let (_client, mut events) = LogClient::from_stream(ours, sample_info());
        viewer
            .write_all(&Packet::ServerHello.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await, ClientEvent::Established);
    }

    #[tokio::test]
    async fn pause_queues_and_resume_flushes_in_order() {
        let (ours, mut viewer) = tokio::io::duplex(4096);
        let (client, mut events) = LogClient::from_stream(ours, sample_info());

        let mut reassembler = Reassembler::new();
        let frames = read_frames(&mut viewer, &mut reassembler, 1).await;
        assert_eq!(Packet::decode(&frames[0]).unwrap().code(), lantern_core::PacketCode::ClientHello);

        viewer
            .write_all(&Packet::Pause.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await, ClientEvent::Paused);

        client.log(&json!({"n": 1})).unwrap();
        client.log(&json!({"n": 2})).unwrap();
        viewer
            .write_all(&Packet::Resume.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await, ClientEvent::Resumed);

        let frames = read_frames(&mut viewer, &mut reassembler, 2).await;
        match Packet::decode(&frames[0]).unwrap() {
            Packet::LogMessage(value) => assert_eq!(value, json!({"n": 1})),
            other => panic!("expected first queued event, got {other:?}"),
        }
        match Packet::decode(&frames[1]).unwrap() {
            Packet::LogMessage(value) => assert_eq!(value, json!({"n": 2})),
            other => panic!("expected second queued event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_reports_disconnected() {
        let (ours, _viewer) = tokio::io::duplex(4096);
        let (client, mut events) = LogClient::from_stream(ours, sample_info());
        client.close();
        assert_eq!(next_event(&mut events).await, ClientEvent::Disconnected);
        assert!(matches!(
            client.log(&json!({"late": true})),
            Ok(()) | Err(ClientError::Closed)
        ));
    }
}
