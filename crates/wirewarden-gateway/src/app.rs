//! Wires every collaborator together in construction order: store, then
//! crypto/platform glue, then the hub, then the services that depend on
//! both (spec §9 "App" design note).

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::mpsc;
use wirewarden_kernel::nft::NftRunner;
use wirewarden_kernel::CurrentPlatform;

use crate::config::Config;
use crate::db::acl::AclStore;
use crate::db::firewall::FirewallStore;
use crate::db::peers::PeerStore;
use crate::db::routes::RouteStore;
use crate::firewall::{AclTableBuilder, ApplyEvent, Applier, FirewallTableBuilder};
use crate::geo::FileGeoProvider;
use crate::hub::Hub;
use crate::identity::{HttpIdentityClient, IdentityClient};
use crate::logs::docker::DockerRunner;
use crate::ratelimit::RateLimiter;
use crate::status::{DockerListProvider, NodeStatsProvider, NodeSyncProvider, OverviewStatsProvider, StatusChecker};
use crate::traffic::TrafficReconciler;
use crate::wgsync::WireguardSync;

/// Every long-lived collaborator, constructed once at startup and cloned
/// into each request via `web::Data`.
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub peers: PeerStore,
    pub firewall: FirewallStore,
    pub acl: AclStore,
    pub routes: RouteStore,
    pub applier: Arc<Applier>,
    pub hub: Arc<Hub>,
    pub identity: Arc<dyn IdentityClient>,
    pub rate_limiter: Arc<RateLimiter>,
    pub traffic: Arc<TrafficReconciler<CurrentPlatform>>,
    pub status: Arc<StatusChecker>,
    /// Base64 public key derived from `SERVER_PRIVATE_KEY` at startup, sent
    /// to peers as their tunnel endpoint's public key.
    pub server_public_key: String,
    /// Same collaborators [`StatusChecker`] polls, reused by the WebSocket
    /// route to serve the immediate snapshot sent on subscribe.
    pub overview: Arc<dyn OverviewStatsProvider>,
    pub docker: Arc<dyn DockerListProvider>,
    /// Pushes the peer registry's desired state to the kernel WireGuard
    /// device; invoked at startup and after every peer mutation (spec §2
    /// C5 "one-time kernel config write + sync").
    pub wg_sync: Arc<WireguardSync<CurrentPlatform>>,
}

impl App {
    pub async fn build(config: Config, pool: PgPool) -> Self {
        let server_public_key = derive_public_key(&config.server_private_key);
        let config = Arc::new(config);

        let peers = PeerStore::new(pool.clone(), config.encryption_key);
        peers.load().await.expect("failed to load peer cache");

        let firewall = FirewallStore::new(pool.clone());
        let acl = AclStore::new(pool.clone());
        let routes = RouteStore::new(pool.clone());

        let geo = Arc::new(FileGeoProvider::new(config.geoip_data_dir.clone(), firewall.clone()));
        let vpn_interfaces = vec![config.wg_interface.clone()];

        let (apply_tx, mut apply_rx) = mpsc::unbounded_channel::<ApplyEvent>();
        let applier = Applier::new(NftRunner::default(), apply_tx);
        applier
            .register(Arc::new(FirewallTableBuilder::new(firewall.clone(), geo, vpn_interfaces)))
            .await;

        let mut vpn_ranges = vec![config.peer_cidr.to_string()];
        if let Some(mesh) = config.mesh_cidr {
            vpn_ranges.push(mesh.to_string());
        }
        applier
            .register(Arc::new(AclTableBuilder::new(peers.clone(), acl.clone(), vpn_ranges)))
            .await;

        // Apply events are logged and folded into the `stats` overview; the
        // closed WebSocket channel set (spec §6) has no dedicated channel
        // for them.
        tokio::spawn(async move {
            while let Some(event) = apply_rx.recv().await {
                tracing::debug!(?event, "firewall apply event");
            }
        });

        let hub = Hub::new();

        let identity: Arc<dyn IdentityClient> = Arc::new(HttpIdentityClient::new(
            config.identity_service_url.clone(),
            config.identity_service_token.clone(),
        ));

        let rate_limiter = Arc::new(RateLimiter::new());
        rate_limiter.clone().spawn_reaper();

        let traffic = TrafficReconciler::<CurrentPlatform>::new(peers.clone(), config.wg_interface.clone());
        traffic.start();

        let docker: Arc<dyn DockerListProvider> = Arc::new(DockerRunner::default());
        let overview: Arc<dyn OverviewStatsProvider> = Arc::new(GatewayOverview {
            peers: peers.clone(),
            applier: applier.clone(),
            traffic: traffic.clone(),
        });
        let node_sync = Arc::new(GatewayNodes { peers: peers.clone() });

        let status = StatusChecker::new(
            hub.clone(),
            node_sync.clone(),
            node_sync,
            docker.clone(),
            overview.clone(),
        );
        status.start().await;

        let wg_sync = Arc::new(WireguardSync::<CurrentPlatform>::new(
            peers.clone(),
            config.wg_interface.clone(),
            config.wg_listen_port,
            config.server_private_key.clone(),
            config.peer_cidr,
        ));
        wg_sync.sync_or_log().await;

        let nat = wirewarden_kernel::iptables::IptablesRunner::default();
        if let Err(err) = nat.ensure_nat(&config.wg_interface, &config.peer_cidr.to_string()).await {
            tracing::error!(error = %err, "failed to apply nat glue");
        }

        Self {
            config,
            peers,
            firewall,
            acl,
            routes,
            applier,
            hub,
            identity,
            rate_limiter,
            traffic,
            status,
            server_public_key,
            overview,
            docker,
            wg_sync,
        }
    }

    pub fn docker_logs(&self) -> Arc<DockerRunner> {
        Arc::new(DockerRunner::default())
    }
}

/// Derive the WireGuard public key from a base64 private key (spec §4.5
/// uses the same `x25519-dalek` keypair shape for peers).
fn derive_public_key(private_key_b64: &str) -> String {
    use base64::Engine;
    use x25519_dalek::{PublicKey, StaticSecret};

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(private_key_b64)
        .expect("SERVER_PRIVATE_KEY must be valid base64");
    let key: [u8; 32] = bytes.try_into().expect("SERVER_PRIVATE_KEY must decode to 32 bytes");
    let secret = StaticSecret::from(key);
    let public = PublicKey::from(&secret);
    base64::engine::general_purpose::STANDARD.encode(public.as_bytes())
}

/// Treats each registered VPN peer as a "node" for the `general_info`/
/// `nodes_updated` channels (spec §4.9); this gateway has no separate
/// fleet-management tier of its own.
struct GatewayNodes {
    peers: PeerStore,
}

impl NodeSyncProvider for GatewayNodes {
    fn sync(&self) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            let peers = self.peers.list();
            serde_json::json!(peers
                .iter()
                .map(|p| serde_json::json!({
                    "id": p.id,
                    "name": p.name,
                    "address": p.address,
                    "enabled": p.enabled,
                }))
                .collect::<Vec<_>>())
        })
    }
}

impl NodeStatsProvider for GatewayNodes {
    fn stats(&self) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            let peers = self.peers.list();
            serde_json::json!({ "total": peers.len(), "enabled": peers.iter().filter(|p| p.enabled).count() })
        })
    }
}

struct GatewayOverview {
    peers: PeerStore,
    applier: Arc<Applier>,
    traffic: Arc<TrafficReconciler<CurrentPlatform>>,
}

impl OverviewStatsProvider for GatewayOverview {
    fn overview(&self) -> BoxFuture<'_, Value> {
        Box::pin(async move {
            let tables = self.applier.stats().await;
            let rates = self.traffic.rates();
            serde_json::json!({
                "peer_count": self.peers.list().len(),
                "tables": tables,
                "last_apply_at": self.applier.last_apply_at(),
                "last_apply_error": self.applier.last_apply_error(),
                "tx_bytes_per_sec": rates.tx_bytes_per_sec,
                "rx_bytes_per_sec": rates.rx_bytes_per_sec,
            })
        })
    }
}

