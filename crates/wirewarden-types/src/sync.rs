//! Desired-state types passed to the kernel platform layer (spec §4.5, §4.6, §6).

use serde::{Deserialize, Serialize};

/// One WireGuard peer as the kernel device should be configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredPeer {
    /// Base64 public key.
    pub public_key: String,
    /// Base64 preshared key, if any.
    pub preshared_key: Option<String>,
    /// CIDR strings for this peer's AllowedIPs.
    pub allowed_ips: Vec<String>,
    /// `host:port`, if this peer is reachable as a server (has a known endpoint).
    pub endpoint: Option<String>,
}

/// The full desired state of one managed WireGuard interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardDesiredState {
    /// Base64 private key for the local interface.
    pub private_key: String,
    /// UDP listen port.
    pub listen_port: u16,
    /// Interface address in `ip/prefix` form.
    pub address: String,
    /// Persistent-keepalive interval in seconds; 0 disables it.
    pub persistent_keepalive: u16,
    /// Desired peer set.
    pub peers: Vec<DesiredPeer>,
}
