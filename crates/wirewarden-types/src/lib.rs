//! wirewarden-types: shared data model for the wirewarden control plane.
//!
//! This crate contains the wire/storage-adjacent types shared between the
//! gateway's HTTP layer, its stores, and the kernel-facing platform code. It
//! has no I/O of its own.

#![warn(missing_docs)]

pub mod acl;
pub mod firewall;
pub mod peer;
pub mod route;
pub mod sync;
pub mod ws;

pub use acl::{AclPolicy, AclRule};
pub use firewall::{Direction, EntryKind, EntrySource, FirewallAction, FirewallEntry, Protocol};
pub use peer::{PeerKind, VpnPeer};
pub use route::DomainRoute;
pub use sync::{DesiredPeer, WireguardDesiredState};
pub use ws::{ChannelName, ClientMessage, ServerMessage};
