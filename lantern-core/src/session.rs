//! Peer sessions, host-driven: packets in, actions out. No I/O; the driver
//! owns the sockets and performs the returned actions.

use std::collections::HashMap;

use serde_json::Value;

use crate::identity::{DeviceInfo, PeerId};
use crate::packet::{Packet, PacketCode};

/// Ticks of silence (no packet, no ping) before a peer is expired.
pub const PEER_TIMEOUT_TICKS: u64 = 5;

/// One registered remote endpoint.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub info: DeviceInfo,
    pub last_seen_tick: u64,
    expired: bool,
}

/// Which event stream a delivered record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Message,
    Network,
}

/// Action for the driver to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// A peer completed its handshake; notify the owner.
    Register { peer: PeerId, info: DeviceInfo },
    /// Send a packet back on the peer's connection.
    Reply(PeerId, Packet),
    /// Forward one log event to the sink.
    Deliver {
        peer: PeerId,
        kind: LogKind,
        event: Value,
    },
    /// Structurally valid frame, semantically unexpected code for this peer's
    /// state. Non-fatal; the frame was dropped.
    Violation { peer: PeerId, code: PacketCode },
    /// Peer removed after its connection closed.
    Unregister(PeerId),
    /// Peer silent past the timeout; the driver should close its connection
    /// and let the ordinary close path unregister it.
    Expire(PeerId),
}

/// Session bookkeeping for every connected client. The map only ever holds
/// peers whose hello has been observed; it is pruned synchronously with
/// connection-closed dispatch.
#[derive(Debug)]
pub struct PeerSessions {
    peers: HashMap<PeerId, PeerRecord>,
    tick_count: u64,
    timeout_ticks: u64,
}

impl PeerSessions {
    pub fn new() -> PeerSessions {
        PeerSessions {
            peers: HashMap::new(),
            tick_count: 0,
            timeout_ticks: PEER_TIMEOUT_TICKS,
        }
    }

    /// Set a custom liveness timeout in ticks.
    pub fn set_timeout_ticks(&mut self, ticks: u64) {
        self.timeout_ticks = ticks;
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    pub fn peer(&self, peer: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&peer)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Dispatch one packet received on `peer`'s connection.
    pub fn on_packet(&mut self, peer: PeerId, packet: Packet) -> Vec<SessionAction> {
        match packet {
            Packet::ClientHello(info) => {
                if self.peers.contains_key(&peer) {
                    return vec![SessionAction::Violation {
                        peer,
                        code: PacketCode::ClientHello,
                    }];
                }
                self.peers.insert(
                    peer,
                    PeerRecord {
                        info: info.clone(),
                        last_seen_tick: self.tick_count,
                        expired: false,
                    },
                );
                vec![
                    SessionAction::Register { peer, info },
                    SessionAction::Reply(peer, Packet::ServerHello),
                ]
            }
            Packet::LogMessage(event) => {
                self.deliver(peer, LogKind::Message, event, PacketCode::LogMessage)
            }
            Packet::LogNetworkMessage(event) => {
                self.deliver(peer, LogKind::Network, event, PacketCode::LogNetworkMessage)
            }
            Packet::Ping => match self.peers.get_mut(&peer) {
                Some(record) => {
                    record.last_seen_tick = self.tick_count;
                    vec![]
                }
                None => vec![SessionAction::Violation {
                    peer,
                    code: PacketCode::Ping,
                }],
            },
            // Viewer-originated codes arriving back at the viewer.
            other => vec![SessionAction::Violation {
                peer,
                code: other.code(),
            }],
        }
    }

    fn deliver(
        &mut self,
        peer: PeerId,
        kind: LogKind,
        event: Value,
        code: PacketCode,
    ) -> Vec<SessionAction> {
        match self.peers.get_mut(&peer) {
            Some(record) => {
                record.last_seen_tick = self.tick_count;
                vec![SessionAction::Deliver { peer, kind, event }]
            }
            None => vec![SessionAction::Violation { peer, code }],
        }
    }

    /// Connection closed, handshake completed or not. Unregisters at most
    /// once; a peer that never said hello produces no action.
    pub fn on_closed(&mut self, peer: PeerId) -> Vec<SessionAction> {
        if self.peers.remove(&peer).is_some() {
            vec![SessionAction::Unregister(peer)]
        } else {
            vec![]
        }
    }

    /// Advance the liveness clock. Peers silent past the timeout are expired
    /// once; unregistration happens when their connection actually closes.
    pub fn tick(&mut self) -> Vec<SessionAction> {
        self.tick_count = self.tick_count.saturating_add(1);
        let tick = self.tick_count;
        let timeout = self.timeout_ticks;
        let mut actions = Vec::new();
        for (&peer, record) in self.peers.iter_mut() {
            if !record.expired && tick.saturating_sub(record.last_seen_tick) > timeout {
                record.expired = true;
                actions.push(SessionAction::Expire(peer));
            }
        }
        actions
    }
}

impl Default for PeerSessions {
    fn default() -> Self {
        PeerSessions::new()
    }
}
