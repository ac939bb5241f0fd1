//! Lantern log-streaming protocol reference implementation.
//! Host-driven: no I/O; the host feeds bytes and packets and receives actions.

pub mod frame;
pub mod identity;
pub mod packet;
pub mod reassembly;
pub mod session;

pub use frame::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};
pub use identity::{DeviceInfo, DeviceInfoProvider, HostInfoProvider, PeerId};
pub use packet::{Packet, PacketCode, PacketDecodeError, PacketEncodeError};
pub use reassembly::{MalformedFrame, Reassembler};
pub use session::{LogKind, PeerSessions, SessionAction};
