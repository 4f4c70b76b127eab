//! wirewarden-kernel: OS-facing primitives with no database dependency.
//!
//! This crate holds everything that talks to the kernel or a kernel-adjacent
//! subprocess: the WireGuard/rtnetlink platform trait (peer sync, interface
//! lifecycle, counter reads), the nftables script builder and runner, and the
//! DNS-answer packet parser. Nothing here touches Postgres or HTTP.

pub mod dns;
pub mod iptables;
pub mod nft;
pub mod platform;

pub use platform::{CurrentPlatform, PeerCounterSample, Platform, PlatformError};
