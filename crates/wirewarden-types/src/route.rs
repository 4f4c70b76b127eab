//! Domain route model (spec §3 "Domain Route").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A reverse-proxy route from a public domain name to an internal target.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DomainRoute {
    /// Unique id.
    pub id: i64,
    /// Validated FQDN this route serves.
    pub domain: String,
    /// Target IPv4 address.
    pub target_ip: String,
    /// Target port.
    pub target_port: i32,
    /// Optional peer id this route is bound to (the route is only valid while the peer exists).
    pub peer_id: Option<String>,
    /// Whether this route currently participates in proxy config regeneration.
    pub enabled: bool,
    /// Whether the backend speaks HTTPS.
    pub https_backend: bool,
    /// Ordered list of reverse-proxy middleware names to apply.
    pub middlewares: Vec<String>,
    /// Optional human-readable description.
    pub description: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-updated timestamp.
    pub updated_at: DateTime<Utc>,
}
