use serde::{Deserialize, Serialize};

pub mod client;
pub mod crypto;
pub mod discovery;
pub mod identity;
pub mod manager;
pub mod protocol;
pub mod server;

pub use identity::Identity;
pub use manager::{TunnelEvent, TunnelManager};

/// First TCP port the peer server tries; `PORT_PROBE_RANGE` ports are probed
/// in total before startup fails.
pub const BASE_SERVER_PORT: u16 = 9500;
pub const PORT_PROBE_RANGE: u16 = 11;

/// UDP port carrying the discovery beacon.
pub const BEACON_PORT: u16 = 41832;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// A peer seen on the LAN, as exposed to the frontend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerHost {
    pub instance_id: String,
    pub hostname: String,
    pub identity_hash: String,
    pub address: String,
    pub port: u16,
    pub status: HostStatus,
}
