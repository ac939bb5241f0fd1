//! Control packets: typed, JSON-bodied messages layered on frames.

use serde_json::Value;

use crate::frame::{self, Frame, FrameEncodeError};
use crate::identity::DeviceInfo;

/// Frame code for each packet variant. Fixed at build time on both ends; the
/// wire carries no version field, so both sides must agree out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketCode {
    ClientHello = 0,
    ServerHello = 1,
    Pause = 2,
    Resume = 3,
    LogMessage = 4,
    LogNetworkMessage = 5,
    Ping = 6,
}

impl PacketCode {
    /// Every defined code, in wire order.
    pub const ALL: [PacketCode; 7] = [
        PacketCode::ClientHello,
        PacketCode::ServerHello,
        PacketCode::Pause,
        PacketCode::Resume,
        PacketCode::LogMessage,
        PacketCode::LogNetworkMessage,
        PacketCode::Ping,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Option<PacketCode> {
        match byte {
            0 => Some(PacketCode::ClientHello),
            1 => Some(PacketCode::ServerHello),
            2 => Some(PacketCode::Pause),
            3 => Some(PacketCode::Resume),
            4 => Some(PacketCode::LogMessage),
            5 => Some(PacketCode::LogNetworkMessage),
            6 => Some(PacketCode::Ping),
            _ => None,
        }
    }
}

/// All control packet variants. One frame code per variant; bodies are JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Handshake: device/app identity, sent once per connection before any
    /// event packets. Receiving it establishes the peer on the viewer side.
    ClientHello(DeviceInfo),
    /// Handshake ack from the viewer.
    ServerHello,
    /// Viewer asks the client to stop shipping events.
    Pause,
    /// Viewer asks the client to resume.
    Resume,
    /// One serialized log event, carried verbatim.
    LogMessage(Value),
    /// One serialized network log event, carried verbatim.
    LogNetworkMessage(Value),
    /// Client liveness.
    Ping,
}

impl Packet {
    pub fn code(&self) -> PacketCode {
        match self {
            Packet::ClientHello(_) => PacketCode::ClientHello,
            Packet::ServerHello => PacketCode::ServerHello,
            Packet::Pause => PacketCode::Pause,
            Packet::Resume => PacketCode::Resume,
            Packet::LogMessage(_) => PacketCode::LogMessage,
            Packet::LogNetworkMessage(_) => PacketCode::LogNetworkMessage,
            Packet::Ping => PacketCode::Ping,
        }
    }

    /// JSON body for this packet. Empty for the bodyless variants.
    pub fn encode_body(&self) -> Result<Vec<u8>, PacketEncodeError> {
        match self {
            Packet::ClientHello(info) => Ok(serde_json::to_vec(info)?),
            Packet::LogMessage(event) | Packet::LogNetworkMessage(event) => {
                Ok(serde_json::to_vec(event)?)
            }
            Packet::ServerHello | Packet::Pause | Packet::Resume | Packet::Ping => Ok(Vec::new()),
        }
    }

    /// Encode to a complete wire frame: header plus JSON body.
    pub fn encode(&self) -> Result<Vec<u8>, PacketEncodeError> {
        let body = self.encode_body()?;
        Ok(frame::encode_frame(self.code(), &body)?)
    }

    /// Decode a received frame back into a packet.
    pub fn decode(frame: &Frame) -> Result<Packet, PacketDecodeError> {
        match frame.code {
            PacketCode::ClientHello => Ok(Packet::ClientHello(serde_json::from_slice(&frame.body)?)),
            PacketCode::ServerHello => Ok(Packet::ServerHello),
            PacketCode::Pause => Ok(Packet::Pause),
            PacketCode::Resume => Ok(Packet::Resume),
            PacketCode::LogMessage => Ok(Packet::LogMessage(serde_json::from_slice(&frame.body)?)),
            PacketCode::LogNetworkMessage => {
                Ok(Packet::LogNetworkMessage(serde_json::from_slice(&frame.body)?))
            }
            PacketCode::Ping => Ok(Packet::Ping),
        }
    }
}

/// Error encoding a packet: the payload would not serialize, or the body does
/// not fit a frame. Either way the connection is unaffected.
#[derive(Debug, thiserror::Error)]
pub enum PacketEncodeError {
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
}

/// Error decoding a packet body. The frame itself was well formed.
#[derive(Debug, thiserror::Error)]
#[error("packet body decoding failed: {0}")]
pub struct PacketDecodeError(#[from] serde_json::Error);
