//! Firewall entry model (spec §3, §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a firewall entry's `value` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum EntryKind {
    /// A single IPv4 address.
    Ip,
    /// An IPv4 CIDR range.
    Range,
    /// An ISO-3166 alpha-2 country code, resolved to CIDRs by the geolocation collaborator.
    Country,
    /// A port or port range (e.g. `"443"` or `"8000-8100"`).
    Port,
}

/// Whether an entry blocks or allows matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum FirewallAction {
    /// Drop matching traffic.
    Block,
    /// Accept matching traffic. The only legal action for `kind = port`.
    Allow,
}

/// Which direction of traffic an entry matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Direction {
    /// Matches on source address (input chain).
    Inbound,
    /// Matches on destination address (output chain).
    Outbound,
    /// Matches both directions.
    Both,
}

/// Which transport protocol a port entry matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Protocol {
    /// TCP only.
    Tcp,
    /// UDP only.
    Udp,
    /// Both TCP and UDP.
    Both,
}

/// How an entry was created, for audit/display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum EntrySource {
    /// Created directly by an operator.
    Manual,
    /// Created by the login rate limiter's lockout escalation.
    Jail,
    /// Created by a bulk import.
    Import,
    /// Promoted from a temporary jail entry to a permanent one.
    Escalated,
}

/// A single firewall entry (spec §3 "Firewall Entry").
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FirewallEntry {
    /// Unique numeric id.
    pub id: i64,
    /// What kind of value this entry matches.
    pub kind: EntryKind,
    /// The IPv4 address, CIDR, ISO-3166 code, or port/range string.
    pub value: String,
    /// Block or allow.
    pub action: FirewallAction,
    /// Which direction this entry matches.
    pub direction: Direction,
    /// Which protocol this entry matches (only meaningful for `kind = port`).
    pub protocol: Protocol,
    /// How this entry was created.
    pub source: EntrySource,
    /// Optional human-readable reason.
    pub reason: Option<String>,
    /// Optional display name, distinct from `reason`.
    pub display_name: Option<String>,
    /// If true, this entry is never auto-evicted (e.g. by housekeeping).
    pub essential: bool,
    /// Optional expiry; once in the past the entry is excluded from builds but retained.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether this entry currently participates in table builds.
    pub enabled: bool,
    /// Number of times this entry has matched, as last observed.
    pub hit_count: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl FirewallEntry {
    /// True if `expires_at` is set and in the past.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether this entry should participate in the next table build.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.is_expired(now)
    }
}
