//! Client identity: the device/app descriptor carried in the hello, peer IDs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned identifier for one connected remote endpoint. Stable for
/// the lifetime of the peer's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Mint a fresh peer ID.
    pub fn new() -> PeerId {
        PeerId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        PeerId::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Flat device/app identity record carried in the client hello. Captured once
/// at construction; static for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: Uuid,
    pub device_name: String,
    pub app_name: String,
    pub os_name: String,
    pub os_version: String,
}

/// Pluggable device descriptor source. Platform integrations implement this;
/// the protocol layer never branches on platform.
pub trait DeviceInfoProvider {
    fn device_info(&self) -> DeviceInfo;
}

/// Descriptor built from the host environment: hostname from the environment
/// when available, `std::env::consts` for the OS name.
#[derive(Debug, Clone)]
pub struct HostInfoProvider {
    info: DeviceInfo,
}

impl HostInfoProvider {
    pub fn new(app_name: impl Into<String>) -> HostInfoProvider {
        let device_name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown-host".to_string());
        HostInfoProvider {
            info: DeviceInfo {
                device_id: Uuid::new_v4(),
                device_name,
                app_name: app_name.into(),
                os_name: std::env::consts::OS.to_string(),
                os_version: std::env::var("LANTERN_OS_VERSION").unwrap_or_default(),
            },
        }
    }
}

impl DeviceInfoProvider for HostInfoProvider {
    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_captures_identity_once() {
        let provider = HostInfoProvider::new("demo");
        let a = provider.device_info();
        let b = provider.device_info();
        assert_eq!(a, b);
        assert_eq!(a.app_name, "demo");
    }

    #[test]
    fn peer_ids_are_distinct() {
        assert_ne!(PeerId::new(), PeerId::new());
    }
}
