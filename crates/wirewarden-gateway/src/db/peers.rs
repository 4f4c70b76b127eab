//! Peer registry (spec §4.5 "Peer Registry").
//!
//! Durable, encryption-at-rest store of VPN peers with an in-memory cache,
//! an IP allocator over the configured peer CIDR, and one-shot legacy-JSON
//! migration. Grounded on the donor's `VpnStore` encryption pattern
//! (`db/vpn.rs`) and keypair generation (`x25519-dalek`), narrowed to a
//! single peer-CIDR allocator per spec §4.5 `allocate_ip`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{error, info, warn};
use wirewarden_types::peer::ClientConfigMode;
use wirewarden_types::{AclPolicy, PeerKind, VpnPeer};
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Error)]
pub enum PeerStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("address already in use")]
    DuplicateAddress,

    #[error("peer not found")]
    NotFound,

    #[error("no available addresses in this CIDR")]
    CidrExhausted,

    #[error("key encryption/decryption failed")]
    Encryption,
}

type Result<T> = std::result::Result<T, PeerStoreError>;

#[derive(Debug, sqlx::FromRow)]
struct PeerRow {
    id: String,
    name: String,
    address: String,
    kind: PeerKind,
    public_key: String,
    private_key_enc: Vec<u8>,
    private_key_nonce: Vec<u8>,
    preshared_key_enc: Option<Vec<u8>>,
    preshared_key_nonce: Option<Vec<u8>>,
    acl_policy: AclPolicy,
    enabled: bool,
    created_at: DateTime<Utc>,
}

/// Cumulative traffic counters for one peer, as last persisted (spec §4.6).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrafficRow {
    pub id: String,
    pub public_key: String,
    pub total_tx: i64,
    pub total_rx: i64,
    pub last_tx: i64,
    pub last_rx: i64,
}

/// Input for creating a new peer; secrets are plaintext base64 here and
/// encrypted before being persisted.
pub struct NewPeer {
    pub name: String,
    pub address: Ipv4Addr,
    pub kind: PeerKind,
    pub public_key: String,
    pub private_key: String,
    pub preshared_key: Option<String>,
    pub acl_policy: AclPolicy,
}

/// Shape of one entry in the legacy peers JSON file (spec §4.5 `migrate_legacy`).
#[derive(Debug, Deserialize)]
struct LegacyPeer {
    id: String,
    name: String,
    address: String,
    kind: PeerKind,
    public_key: String,
    private_key: String,
    #[serde(default)]
    preshared_key: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Durable peer store with an in-memory read cache.
#[derive(Clone)]
pub struct PeerStore {
    pool: PgPool,
    encryption_key: [u8; 32],
    cache: DashMap<String, VpnPeer>,
}

impl PeerStore {
    pub fn new(pool: PgPool, encryption_key: [u8; 32]) -> Self {
        Self {
            pool,
            encryption_key,
            cache: DashMap::new(),
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|_| PeerStoreError::Encryption)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| PeerStoreError::Encryption)?;
        Ok((ciphertext, nonce.to_vec()))
    }

    fn decrypt(&self, ciphertext: &[u8], nonce_bytes: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|_| PeerStoreError::Encryption)?;
        let nonce = Nonce::from_exact_iter(nonce_bytes.iter().copied())
            .ok_or(PeerStoreError::Encryption)?;
        cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| PeerStoreError::Encryption)
    }

    /// Decrypt one row into a [`VpnPeer`]. A decryption failure leaves the
    /// corresponding key field empty and logs, rather than dropping the peer
    /// (spec §4.5 `load`).
    fn row_to_peer(&self, row: PeerRow) -> VpnPeer {
        let private_key = match self.decrypt(&row.private_key_enc, &row.private_key_nonce) {
            Ok(bytes) => BASE64.encode(bytes),
            Err(_) => {
                error!(peer_id = %row.id, "failed to decrypt private key, leaving empty");
                String::new()
            }
        };

        let preshared_key = match (row.preshared_key_enc, row.preshared_key_nonce) {
            (Some(enc), Some(nonce)) => match self.decrypt(&enc, &nonce) {
                Ok(bytes) => BASE64.encode(bytes),
                Err(_) => {
                    error!(peer_id = %row.id, "failed to decrypt preshared key, leaving empty");
                    String::new()
                }
            },
            _ => String::new(),
        };

        VpnPeer {
            id: row.id,
            name: row.name,
            address: row.address,
            kind: row.kind,
            public_key: row.public_key,
            private_key,
            preshared_key,
            acl_policy: row.acl_policy,
            enabled: row.enabled,
            created_at: row.created_at,
            last_handshake: None,
        }
    }

    /// Populate the in-memory cache from the store. Call once at startup.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self) -> Result<()> {
        let rows: Vec<PeerRow> = sqlx::query_as("SELECT * FROM vpn_peers ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        self.cache.clear();
        for row in rows {
            let peer = self.row_to_peer(row);
            self.cache.insert(peer.id.clone(), peer);
        }
        info!(count = self.cache.len(), "loaded peer registry");
        Ok(())
    }

    /// Generate a fresh x25519 keypair (spec §4.5, grounded on the donor's `create_key`).
    pub fn generate_keypair() -> (String, String) {
        let secret = StaticSecret::random_from_rng(&mut OsRng);
        let public = PublicKey::from(&secret);
        (BASE64.encode(secret.to_bytes()), BASE64.encode(public.as_bytes()))
    }

    /// Sweep from `.2` upward over `cidr`, returning the first address not
    /// already claimed by a cached peer. Empty string on exhaustion (spec
    /// §4.5 `allocate_ip`, testable property 3).
    pub fn allocate_ip(&self, cidr: Ipv4Network) -> String {
        let used: std::collections::HashSet<u32> = self
            .cache
            .iter()
            .filter_map(|e| e.value().address.parse::<Ipv4Addr>().ok())
            .map(u32::from)
            .collect();

        let network = u32::from(cidr.network());
        let broadcast = u32::from(cidr.broadcast());

        let mut candidate = network + 2; // skip .0 (network) and .1 (server)
        while candidate <= broadcast {
            if !used.contains(&candidate) {
                return Ipv4Addr::from(candidate).to_string();
            }
            candidate += 1;
        }
        String::new()
    }

    /// Insert a new peer. Secrets are encrypted before persistence; the
    /// cache stores a copy, never a reference the caller can later mutate.
    #[tracing::instrument(skip(self, peer), fields(peer_name = %peer.name))]
    pub async fn add(&self, peer: NewPeer) -> Result<VpnPeer> {
        let (priv_enc, priv_nonce) = self.encrypt(
            &BASE64
                .decode(&peer.private_key)
                .map_err(|_| PeerStoreError::Encryption)?,
        )?;

        let psk_pair = match &peer.preshared_key {
            Some(psk) => {
                let raw = BASE64.decode(psk).map_err(|_| PeerStoreError::Encryption)?;
                let (enc, nonce) = self.encrypt(&raw)?;
                Some((enc, nonce))
            }
            None => None,
        };

        let id = uuid::Uuid::new_v4().to_string();
        let address = peer.address.to_string();

        let row: PeerRow = sqlx::query_as(
            "INSERT INTO vpn_peers
                (id, name, address, kind, public_key, private_key_enc, private_key_nonce,
                 preshared_key_enc, preshared_key_nonce, acl_policy, enabled)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, true)
             RETURNING *",
        )
        .bind(&id)
        .bind(&peer.name)
        .bind(&address)
        .bind(peer.kind)
        .bind(&peer.public_key)
        .bind(&priv_enc)
        .bind(&priv_nonce)
        .bind(psk_pair.as_ref().map(|(e, _)| e.clone()))
        .bind(psk_pair.as_ref().map(|(_, n)| n.clone()))
        .bind(peer.acl_policy)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.constraint() == Some("vpn_peers_address_key") => {
                PeerStoreError::DuplicateAddress
            }
            _ => PeerStoreError::Database(e),
        })?;

        let peer = self.row_to_peer(row);
        self.cache.insert(peer.id.clone(), peer.clone());
        Ok(peer)
    }

    /// Return a copy so callers cannot mutate cached state (spec §4.5 `get`).
    pub fn get(&self, id: &str) -> Option<VpnPeer> {
        self.cache.get(id).map(|e| e.value().clone())
    }

    /// Return copies of every cached peer (spec §4.5 `list`).
    pub fn list(&self) -> Vec<VpnPeer> {
        self.cache.iter().map(|e| e.value().clone()).collect()
    }

    /// Remove from cache, then store; cascades to domain routes bound to
    /// this peer first (spec §4.5 `delete`).
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM domain_routes WHERE peer_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM vpn_peers WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(PeerStoreError::NotFound);
        }

        self.cache.remove(id);
        Ok(())
    }

    /// Decode the legacy JSON file (if present), encrypt secrets, strip them
    /// from a shallow copy stored as `raw_data`, and upsert on-conflict-by-
    /// address. On success, rename `path` to `path.migrated` (spec §4.5
    /// `migrate_legacy`, §9 "runs once at startup").
    #[tracing::instrument(skip(self))]
    pub async fn migrate_legacy(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }

        let contents = tokio::fs::read_to_string(path).await?;
        let legacy: HashMap<String, LegacyPeer> = match serde_json::from_str(&contents) {
            Ok(map) => map,
            Err(err) => {
                warn!(error = %err, "legacy peers file is malformed, leaving in place");
                return Ok(0);
            }
        };

        let mut migrated = 0usize;
        for (_key, peer) in legacy {
            let raw_data = serde_json::json!({
                "id": peer.id,
                "name": peer.name,
                "address": peer.address,
                "kind": peer.kind,
                "public_key": peer.public_key,
                "enabled": peer.enabled,
            });

            let (priv_enc, priv_nonce) = self.encrypt(
                &BASE64
                    .decode(&peer.private_key)
                    .map_err(|_| PeerStoreError::Encryption)?,
            )?;
            let psk_pair = match &peer.preshared_key {
                Some(psk) => {
                    let raw = BASE64.decode(psk).map_err(|_| PeerStoreError::Encryption)?;
                    Some(self.encrypt(&raw)?)
                }
                None => None,
            };

            let row: PeerRow = sqlx::query_as(
                "INSERT INTO vpn_peers
                    (id, name, address, kind, public_key, private_key_enc, private_key_nonce,
                     preshared_key_enc, preshared_key_nonce, acl_policy, enabled, raw_data)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'selected', $10, $11)
                 ON CONFLICT (address) DO UPDATE SET
                    name = EXCLUDED.name,
                    kind = EXCLUDED.kind,
                    public_key = EXCLUDED.public_key,
                    private_key_enc = EXCLUDED.private_key_enc,
                    private_key_nonce = EXCLUDED.private_key_nonce,
                    preshared_key_enc = EXCLUDED.preshared_key_enc,
                    preshared_key_nonce = EXCLUDED.preshared_key_nonce,
                    enabled = EXCLUDED.enabled,
                    raw_data = EXCLUDED.raw_data
                 RETURNING *",
            )
            .bind(&peer.id)
            .bind(&peer.name)
            .bind(&peer.address)
            .bind(peer.kind)
            .bind(&peer.public_key)
            .bind(&priv_enc)
            .bind(&priv_nonce)
            .bind(psk_pair.as_ref().map(|(e, _)| e.clone()))
            .bind(psk_pair.as_ref().map(|(_, n)| n.clone()))
            .bind(peer.enabled)
            .bind(raw_data)
            .fetch_one(&self.pool)
            .await?;

            let peer = self.row_to_peer(row);
            self.cache.insert(peer.id.clone(), peer);
            migrated += 1;
        }

        let migrated_path = path.with_extension("json.migrated");
        tokio::fs::rename(path, &migrated_path).await?;
        info!(count = migrated, "migrated legacy peers file");
        Ok(migrated)
    }

    /// Render a WireGuard client config (spec §4.5 `generate_client_config`).
    ///
    /// Split mode never adds the server's own public IP to `AllowedIPs`: the
    /// server IP is the tunnel endpoint, and routing it through the tunnel
    /// would create a loop.
    pub fn generate_client_config(
        &self,
        peer: &VpnPeer,
        mode: ClientConfigMode,
        server_public_key: &str,
        server_endpoint: &str,
        peer_cidr: Ipv4Network,
        mesh_cidr: Option<Ipv4Network>,
        dns: Option<&str>,
    ) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        writeln!(out, "[Interface]").unwrap();
        writeln!(out, "PrivateKey = {}", peer.private_key).unwrap();
        writeln!(out, "Address = {}/32", peer.address).unwrap();
        if let Some(dns) = dns {
            writeln!(out, "DNS = {dns}").unwrap();
        }

        let allowed_ips = match mode {
            ClientConfigMode::Full => "0.0.0.0/0, ::/0".to_string(),
            ClientConfigMode::Split => {
                let mut ranges = vec![peer_cidr.to_string()];
                if let Some(mesh) = mesh_cidr {
                    ranges.push(mesh.to_string());
                }
                ranges.join(", ")
            }
        };

        writeln!(out).unwrap();
        writeln!(out, "[Peer]").unwrap();
        writeln!(out, "PublicKey = {server_public_key}").unwrap();
        if !peer.preshared_key.is_empty() {
            writeln!(out, "PresharedKey = {}", peer.preshared_key).unwrap();
        }
        writeln!(out, "Endpoint = {server_endpoint}").unwrap();
        writeln!(out, "AllowedIPs = {allowed_ips}").unwrap();
        out
    }

    /// Every wireguard-kind peer's traffic counters (spec §4.6 step 2).
    pub async fn traffic_snapshot(&self) -> Result<Vec<TrafficRow>> {
        let rows = sqlx::query_as(
            "SELECT id, public_key, total_tx, total_rx, last_tx, last_rx
             FROM vpn_peers
             WHERE kind = 'wireguard' AND public_key != ''",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn record_traffic(
        &self,
        id: &str,
        total_tx: i64,
        total_rx: i64,
        last_tx: i64,
        last_rx: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE vpn_peers SET total_tx = $1, total_rx = $2, last_tx = $3, last_rx = $4 WHERE id = $5",
        )
        .bind(total_tx)
        .bind(total_rx)
        .bind(last_tx)
        .bind(last_rx)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(id: &str, address: &str) -> VpnPeer {
        VpnPeer {
            id: id.to_string(),
            name: id.to_string(),
            address: address.to_string(),
            kind: PeerKind::Wireguard,
            public_key: "pub".to_string(),
            private_key: "priv".to_string(),
            preshared_key: String::new(),
            acl_policy: AclPolicy::Selected,
            enabled: true,
            created_at: Utc::now(),
            last_handshake: None,
        }
    }

    fn store_with_cache(entries: &[(&str, &str)]) -> PeerStore {
        let cache = DashMap::new();
        for (id, addr) in entries {
            cache.insert(id.to_string(), make_peer(id, addr));
        }
        PeerStore {
            // Never connected in these tests; allocate_ip/get/list don't touch the pool.
            pool: sqlx::pool::PoolOptions::new().connect_lazy("postgres://unused/unused").unwrap(),
            encryption_key: [0u8; 32],
            cache,
        }
    }

    // Testable property 3: for 10.0.0.0/30, allocator returns .2, then .3, then empty.
    #[test]
    fn allocate_ip_skips_network_and_gateway() {
        let cidr: Ipv4Network = "10.0.0.0/30".parse().unwrap();

        let store = store_with_cache(&[]);
        assert_eq!(store.allocate_ip(cidr), "10.0.0.2");

        let store = store_with_cache(&[("a", "10.0.0.2")]);
        assert_eq!(store.allocate_ip(cidr), "10.0.0.3");

        let store = store_with_cache(&[("a", "10.0.0.2"), ("b", "10.0.0.3")]);
        assert_eq!(store.allocate_ip(cidr), "");
    }

    #[test]
    fn split_mode_never_includes_server_ip_loop() {
        let store = store_with_cache(&[]);
        let peer = make_peer("p1", "10.8.0.2");
        let cidr: Ipv4Network = "10.8.0.0/24".parse().unwrap();
        let config = store.generate_client_config(
            &peer,
            ClientConfigMode::Split,
            "server-pub",
            "vpn.example.com:51820",
            cidr,
            None,
            None,
        );
        assert!(config.contains("AllowedIPs = 10.8.0.0/24"));
        assert!(!config.contains("Endpoint = 10.8.0.0/24"));
    }

    #[test]
    fn full_mode_routes_everything() {
        let store = store_with_cache(&[]);
        let peer = make_peer("p1", "10.8.0.2");
        let cidr: Ipv4Network = "10.8.0.0/24".parse().unwrap();
        let config = store.generate_client_config(
            &peer,
            ClientConfigMode::Full,
            "server-pub",
            "vpn.example.com:51820",
            cidr,
            None,
            Some("10.8.0.1"),
        );
        assert!(config.contains("AllowedIPs = 0.0.0.0/0, ::/0"));
        assert!(config.contains("DNS = 10.8.0.1"));
    }
}
