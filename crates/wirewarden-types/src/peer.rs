//! VPN peer model (spec §3 "VPN Peer", §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::acl::AclPolicy;

/// Which tunnel technology a peer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum PeerKind {
    /// A WireGuard peer, allocated from the peer CIDR.
    Wireguard,
    /// A mesh-VPN peer, allocated from the mesh CIDR.
    Mesh,
}

/// A VPN peer (spec §3 "VPN Peer").
///
/// `private_key`/`preshared_key` are the **decrypted** form, produced by the
/// peer registry on load; they are never the on-disk representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnPeer {
    /// Stable opaque string id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// IPv4 address, unique across all peers, within the configured peer/mesh CIDR.
    pub address: String,
    /// Tunnel technology.
    pub kind: PeerKind,
    /// Base64 WireGuard public key.
    pub public_key: String,
    /// Decrypted base64 private key, empty if decryption failed on load.
    pub private_key: String,
    /// Decrypted base64 preshared key, empty if none configured.
    pub preshared_key: String,
    /// ACL policy overlaying explicit rules (spec §4.4).
    pub acl_policy: AclPolicy,
    /// Whether this peer currently participates in kernel sync and ACL builds.
    pub enabled: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last observed handshake time, not persisted — read from kernel state.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_handshake: Option<DateTime<Utc>>,
}

/// Which WireGuard config style to render for a peer (spec §4.5 `generate_client_config`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientConfigMode {
    /// `AllowedIPs = 0.0.0.0/0, ::/0` plus DNS — route everything through the tunnel.
    Full,
    /// `AllowedIPs` limited to the peer CIDR (and mesh CIDR if configured); DNS retained.
    Split,
}
