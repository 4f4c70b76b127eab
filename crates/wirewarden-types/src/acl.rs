//! VPN access-control model (spec §3 "ACL Rule", §4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Peer-level overlay policy (spec §4.4 "policy lattice").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum AclPolicy {
    /// Isolate this peer from every other peer, regardless of explicit rules.
    BlockAll,
    /// Accept traffic between this peer and every peer-CIDR range.
    AllowAll,
    /// Only the explicit `AclRule` pairs involving this peer apply.
    Selected,
}

/// An explicit source→target accept rule between two peers.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AclRule {
    /// Unique id.
    pub id: i64,
    /// Source peer id.
    pub source_peer_id: String,
    /// Target peer id.
    pub target_peer_id: String,
    /// If true, the rule also implies target→source.
    pub bidirectional: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}
