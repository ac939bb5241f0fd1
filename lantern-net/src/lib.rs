//! Lantern networking: connection lifecycle, viewer server, client handle,
//! LAN discovery. Pure protocol logic lives in `lantern-core`; this crate
//! owns the sockets and tasks.

pub mod client;
pub mod connection;
pub mod discovery;
pub mod server;

pub use client::{ClientError, ClientEvent, LogClient};
pub use connection::{Connection, ConnectionEvent, ConnectionState, ParseError, SendError};
pub use discovery::{browse, Advertisement, Advertiser, DiscoveryEvent};
pub use server::{BroadcastReport, LogServer, ServerEvent, ServerSendError};
