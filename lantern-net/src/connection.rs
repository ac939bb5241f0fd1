//! Connection: one socket, one reassembly buffer, serialized writes, ordered
//! delivery to the owner over an event channel.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use lantern_core::packet::{Packet, PacketEncodeError};
use lantern_core::reassembly::{MalformedFrame, Reassembler};

const READ_BUF_SIZE: usize = 8 * 1024;

/// Connection lifecycle. `Closed` is terminal and reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Everything a connection reports to its owner, in wire order for packets.
/// A terminal condition (`Completed` or `Error`) is delivered at most once,
/// always before `State(Closed)`; a locally canceled connection reports only
/// `State(Closed)`.
#[derive(Debug)]
pub enum ConnectionEvent {
    State(ConnectionState),
    Packet(Packet),
    /// Frame or body decoding failed; the offending bytes are attached. A bad
    /// body drops one frame and the connection stays open; a bad frame code
    /// loses framing sync and the connection closes.
    ParseFailed { error: ParseError, bytes: Vec<u8> },
    /// A transport write failed. Non-terminal; the read side decides liveness.
    SendFailed(std::io::Error),
    /// Peer closed its write side.
    Completed,
    /// Transport failure.
    Error(std::io::Error),
}

/// Inbound parsing failure, tagged with which layer rejected the bytes.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Frame(#[from] MalformedFrame),
    #[error(transparent)]
    Body(#[from] lantern_core::packet::PacketDecodeError),
}

/// Error returned by `send`: the packet could not be encoded, or the
/// connection is already closed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] PacketEncodeError),
    #[error("connection closed")]
    Closed,
}

/// Handle to one connection. Cheap to clone; sends from any task are
/// serialized through a single writer task. Dropping every handle cancels
/// the connection.
#[derive(Debug, Clone)]
pub struct Connection {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConnectionState>,
}

impl Connection {
    /// Client side: dial `addr`. The connection reports `Connecting`, then
    /// `Connected` on success; a dial failure reports the transport error and
    /// lands in `Closed`. Packets queued before the dial completes are
    /// flushed in order afterwards.
    pub fn connect(addr: SocketAddr, events: mpsc::UnboundedSender<ConnectionEvent>) -> Connection {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let handle = Connection {
            outbound: outbound_tx,
            cancel: Arc::new(cancel_tx),
            state: state_rx,
        };
        tokio::spawn(async move {
            set_state(&state_tx, &events, ConnectionState::Connecting);
            let mut cancel = cancel_rx.clone();
            let dial = tokio::select! {
                _ = cancel.changed() => None,
                result = TcpStream::connect(addr) => Some(result),
            };
            match dial {
                Some(Ok(stream)) => {
                    set_state(&state_tx, &events, ConnectionState::Connected);
                    run(stream, outbound_rx, cancel_rx, state_tx, events).await;
                }
                Some(Err(error)) => {
                    debug!(%addr, %error, "dial failed");
                    let _ = events.send(ConnectionEvent::Error(error));
                    set_state(&state_tx, &events, ConnectionState::Closed);
                }
                None => set_state(&state_tx, &events, ConnectionState::Closed),
            }
        });
        handle
    }

    /// Server side, or an alternate transport: the stream is already up, so
    /// the connection goes straight to `Connected`.
    pub fn from_stream<S>(stream: S, events: mpsc::UnboundedSender<ConnectionEvent>) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let handle = Connection {
            outbound: outbound_tx,
            cancel: Arc::new(cancel_tx),
            state: state_rx,
        };
        tokio::spawn(async move {
            set_state(&state_tx, &events, ConnectionState::Connected);
            run(stream, outbound_rx, cancel_rx, state_tx, events).await;
        });
        handle
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Serialize and send one packet. Encoding failures are returned to the
    /// caller; the connection itself is unaffected.
    pub fn send(&self, packet: &Packet) -> Result<(), SendError> {
        let bytes = packet.encode()?;
        self.outbound.send(bytes).map_err(|_| SendError::Closed)
    }

    /// Send pre-encoded frame bytes (broadcast encodes once).
    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        self.outbound.send(bytes).map_err(|_| SendError::Closed)
    }

    /// Close the transport and unblock the receive loop promptly. Idempotent;
    /// safe to call from any task.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

fn set_state(
    state: &watch::Sender<ConnectionState>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    next: ConnectionState,
) {
    if *state.borrow() == next {
        return;
    }
    let _ = state.send(next);
    let _ = events.send(ConnectionEvent::State(next));
}

async fn run<S>(
    stream: S,
    outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut cancel: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (stop_tx, stop_rx) = watch::channel(false);
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, stop_rx, events.clone()));
    read_loop(reader, &mut cancel, &events).await;
    // Stop the writer before reporting Closed so sends fail deterministically
    // once the owner has observed the close.
    let _ = stop_tx.send(true);
    let _ = writer_task.await;
    set_state(&state, &events, ConnectionState::Closed);
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut stop: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let bytes = tokio::select! {
            _ = stop.changed() => break,
            msg = outbound.recv() => match msg {
                Some(bytes) => bytes,
                None => break,
            },
        };
        if let Err(error) = writer.write_all(&bytes).await {
            let _ = events.send(ConnectionEvent::SendFailed(error));
            break;
        }
        let _ = writer.flush().await;
    }
}

async fn read_loop<R>(
    mut reader: R,
    cancel: &mut watch::Receiver<bool>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reassembler = Reassembler::new();
    let mut frames = Vec::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancel.changed() => return,
            result = reader.read(&mut buf) => result,
        };
        match read {
            Ok(0) => {
                let _ = events.send(ConnectionEvent::Completed);
                return;
            }
            Ok(n) => {
                let outcome = reassembler.push(&buf[..n], &mut frames);
                for frame in frames.drain(..) {
                    match Packet::decode(&frame) {
                        Ok(packet) => {
                            let _ = events.send(ConnectionEvent::Packet(packet));
                        }
                        Err(error) => {
                            let _ = events.send(ConnectionEvent::ParseFailed {
                                error: error.into(),
                                bytes: frame.body,
                            });
                        }
                    }
                }
                if let Err(error) = outcome {
                    // Framing sync is gone; resynchronization is undefined, so
                    // surface the failure and close.
                    let _ = events.send(ConnectionEvent::ParseFailed {
                        error: error.into(),
                        bytes: reassembler.buffered().to_vec(),
                    });
                    return;
                }
            }
            Err(error) => {
                let _ = events.send(ConnectionEvent::Error(error));
                return;
            }
        }
    }
}
