// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! WireGuard interface lifecycle and peer sync (spec §4.5, §4.6, §6).

use std::future::Future;
use std::net::IpAddr;

use thiserror::Error;
use wirewarden_types::WireguardDesiredState;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("failed to decode base64 key: {0}")]
    KeyDecode(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("IP address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("CIDR parse error: {0}")]
    CidrParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One peer's cumulative byte counters as last reported by the kernel (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCounterSample {
    /// Base64 public key.
    pub public_key: String,
    /// Cumulative bytes received.
    pub rx_bytes: u64,
    /// Cumulative bytes sent.
    pub tx_bytes: u64,
}

pub trait Platform {
    fn ensure_interface(name: &str) -> impl Future<Output = Result<(), PlatformError>> + Send;
    fn remove_interface(name: &str) -> impl Future<Output = Result<(), PlatformError>> + Send;
    fn interface_exists(name: &str) -> impl Future<Output = Result<bool, PlatformError>> + Send;

    /// Converge the named interface's device config and peer set to `desired`.
    ///
    /// `prev` is the last state this process itself applied, used to compute a
    /// differential update; `None` forces a full replace (first apply, or after
    /// the interface was just created).
    fn apply_config(
        name: &str,
        desired: &WireguardDesiredState,
        prev: Option<&WireguardDesiredState>,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;

    /// Read cumulative per-peer byte counters (spec §4.6 step 1, §6 `wg show ... dump`).
    fn read_counters(
        name: &str,
    ) -> impl Future<Output = Result<Vec<PeerCounterSample>, PlatformError>> + Send;
}

#[cfg(target_os = "linux")]
pub type CurrentPlatform = linux::LinuxPlatform;

#[cfg(not(target_os = "linux"))]
pub type CurrentPlatform = StubPlatform;

// -- Helper utilities --

pub fn decode_key(b64: &str) -> Result<[u8; 32], PlatformError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| PlatformError::InvalidKeyLength(len))
}

pub fn parse_cidr(s: &str) -> Result<(IpAddr, u8), PlatformError> {
    let (addr_str, prefix_str) = s
        .split_once('/')
        .ok_or_else(|| PlatformError::CidrParse(s.to_string()))?;
    let addr: IpAddr = addr_str.parse()?;
    let prefix: u8 = prefix_str
        .parse()
        .map_err(|_| PlatformError::CidrParse(s.to_string()))?;
    Ok((addr, prefix))
}

// -- Stub platform for non-Linux --

pub struct StubPlatform;

impl Platform for StubPlatform {
    async fn ensure_interface(_name: &str) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn remove_interface(_name: &str) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn interface_exists(_name: &str) -> Result<bool, PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn apply_config(
        _name: &str,
        _desired: &WireguardDesiredState,
        _prev: Option<&WireguardDesiredState>,
    ) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn read_counters(_name: &str) -> Result<Vec<PeerCounterSample>, PlatformError> {
        Err(PlatformError::Unsupported)
    }
}

// -- Linux implementation --

#[cfg(target_os = "linux")]
pub mod linux {
    use std::collections::HashMap;
    use std::net::{IpAddr, SocketAddr};

    use base64::Engine;
    use futures::TryStreamExt;
    use tracing::{debug, info};
    use wireguard_uapi::{DeviceInterface, RouteSocket, WgSocket, set};

    use wirewarden_types::{DesiredPeer, WireguardDesiredState};

    use super::{Platform, PeerCounterSample, PlatformError, decode_key, parse_cidr};

    pub struct LinuxPlatform;

    impl Platform for LinuxPlatform {
        async fn ensure_interface(name: &str) -> Result<(), PlatformError> {
            let mut route =
                RouteSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
            let existing = route
                .list_device_names()
                .map_err(|e| PlatformError::Interface(e.to_string()))?;

            if existing.iter().any(|n| n == name) {
                debug!(interface = name, "interface already exists");
                return Ok(());
            }

            info!(interface = name, "creating wireguard interface");
            route
                .add_device(name)
                .map_err(|e| PlatformError::Interface(e.to_string()))?;
            Ok(())
        }

        async fn remove_interface(name: &str) -> Result<(), PlatformError> {
            let mut route =
                RouteSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
            let existing = route
                .list_device_names()
                .map_err(|e| PlatformError::Interface(e.to_string()))?;

            if existing.iter().any(|n| n == name) {
                info!(interface = name, "removing interface");
                route
                    .del_device(name)
                    .map_err(|e| PlatformError::Interface(e.to_string()))?;
            }
            Ok(())
        }

        async fn interface_exists(name: &str) -> Result<bool, PlatformError> {
            let mut route =
                RouteSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
            let existing = route
                .list_device_names()
                .map_err(|e| PlatformError::Interface(e.to_string()))?;
            Ok(existing.iter().any(|n| n == name))
        }

        async fn apply_config(
            name: &str,
            desired: &WireguardDesiredState,
            prev: Option<&WireguardDesiredState>,
        ) -> Result<(), PlatformError> {
            let created = !Self::interface_exists(name).await?;
            if created {
                Self::ensure_interface(name).await?;
            }

            match prev {
                Some(prev) if !created => {
                    apply_config_diff(name, prev, desired)?;

                    if prev.address != desired.address {
                        assign_address(name, &desired.address).await?;
                    }

                    info!(interface = name, "applied differential wireguard config");
                }
                _ => {
                    apply_device_config(name, desired)?;
                    assign_address(name, &desired.address).await?;
                    set_link_up(name).await?;
                    info!(interface = name, "applied full wireguard config");
                }
            }

            Ok(())
        }

        async fn read_counters(name: &str) -> Result<Vec<PeerCounterSample>, PlatformError> {
            let mut wg =
                WgSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
            let device = wg
                .get_device(DeviceInterface::from_name(name))
                .map_err(|e| PlatformError::Interface(e.to_string()))?;

            let samples = device
                .peers
                .iter()
                .map(|p| PeerCounterSample {
                    public_key: base64::engine::general_purpose::STANDARD.encode(p.public_key),
                    rx_bytes: p.rx_bytes,
                    tx_bytes: p.tx_bytes,
                })
                .collect();

            Ok(samples)
        }
    }

    fn apply_device_config(
        name: &str,
        desired: &WireguardDesiredState,
    ) -> Result<(), PlatformError> {
        let private_key = decode_key(&desired.private_key)?;

        let peer_data: Vec<PeerOwned> = desired
            .peers
            .iter()
            .map(|p| build_peer_owned(p, desired.persistent_keepalive))
            .collect::<Result<_, PlatformError>>()?;

        let peers: Vec<set::Peer<'_>> = peer_data
            .iter()
            .map(|p| build_set_peer(p, vec![set::WgPeerF::ReplaceAllowedIps]))
            .collect();

        let dev = set::Device::from_ifname(name)
            .private_key(&private_key)
            .listen_port(desired.listen_port)
            .flags(vec![set::WgDeviceF::ReplacePeers])
            .peers(peers);

        let mut wg = WgSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
        wg.set_device(dev)
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        debug!(
            interface = name,
            listen_port = desired.listen_port,
            peer_count = desired.peers.len(),
            "applied wireguard device config"
        );
        Ok(())
    }

    fn apply_config_diff(
        name: &str,
        prev: &WireguardDesiredState,
        next: &WireguardDesiredState,
    ) -> Result<(), PlatformError> {
        let key_changed = prev.private_key != next.private_key;
        let port_changed = prev.listen_port != next.listen_port;

        if key_changed || port_changed {
            set_device_key_port(name, next)?;
        }

        let prev_peers: HashMap<&str, &DesiredPeer> = prev
            .peers
            .iter()
            .map(|p| (p.public_key.as_str(), p))
            .collect();
        let next_peers: HashMap<&str, &DesiredPeer> = next
            .peers
            .iter()
            .map(|p| (p.public_key.as_str(), p))
            .collect();

        let added: Vec<&DesiredPeer> = next_peers
            .iter()
            .filter(|(k, _)| !prev_peers.contains_key(*k))
            .map(|(_, p)| *p)
            .collect();

        let removed: Vec<&str> = prev_peers
            .keys()
            .filter(|k| !next_peers.contains_key(*k))
            .copied()
            .collect();

        let updated: Vec<&DesiredPeer> = next_peers
            .iter()
            .filter(|(k, p)| prev_peers.get(*k).is_some_and(|old| old != *p))
            .map(|(_, p)| *p)
            .collect();

        if !added.is_empty() {
            debug!(interface = name, count = added.len(), "adding peers");
            add_peers(name, &added, next.persistent_keepalive)?;
        }

        if !removed.is_empty() {
            debug!(interface = name, count = removed.len(), "removing peers");
            remove_peers(name, &removed)?;
        }

        if !updated.is_empty() {
            debug!(interface = name, count = updated.len(), "updating peers");
            update_peers(name, &updated, next.persistent_keepalive)?;
        }

        Ok(())
    }

    fn set_device_key_port(
        name: &str,
        desired: &WireguardDesiredState,
    ) -> Result<(), PlatformError> {
        let private_key = decode_key(&desired.private_key)?;

        let dev = set::Device::from_ifname(name)
            .private_key(&private_key)
            .listen_port(desired.listen_port);

        let mut wg = WgSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
        wg.set_device(dev)
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        debug!(interface = name, listen_port = desired.listen_port, "updated device key/port");
        Ok(())
    }

    fn build_peer_owned(
        peer: &DesiredPeer,
        persistent_keepalive: u16,
    ) -> Result<PeerOwned, PlatformError> {
        let pub_key = decode_key(&peer.public_key)?;
        let endpoint: Option<SocketAddr> = peer.endpoint.as_deref().and_then(|ep| ep.parse().ok());
        let preshared_key = match peer.preshared_key.as_deref() {
            Some(psk) => Some(decode_key(psk)?),
            None => None,
        };
        let allowed_ips: Vec<(IpAddr, u8)> = peer
            .allowed_ips
            .iter()
            .map(|ip| parse_cidr(ip))
            .collect::<Result<_, _>>()?;
        Ok(PeerOwned {
            pub_key,
            endpoint,
            allowed_ips,
            persistent_keepalive,
            preshared_key,
        })
    }

    fn build_set_peer<'a>(p: &'a PeerOwned, flags: Vec<set::WgPeerF>) -> set::Peer<'a> {
        let mut peer = set::Peer::from_public_key(&p.pub_key).flags(flags);

        if let Some(ref ep) = p.endpoint {
            peer = peer.endpoint(ep);
        }
        if let Some(ref psk) = p.preshared_key {
            peer = peer.preshared_key(psk);
        }

        let allowed: Vec<set::AllowedIp<'_>> = p
            .allowed_ips
            .iter()
            .map(|(addr, cidr)| {
                let mut aip = set::AllowedIp::from_ipaddr(addr);
                aip.cidr_mask = Some(*cidr);
                aip
            })
            .collect();

        if p.persistent_keepalive > 0 {
            peer = peer.persistent_keepalive_interval(p.persistent_keepalive);
        }

        peer.allowed_ips(allowed)
    }

    fn add_peers(
        name: &str,
        peers: &[&DesiredPeer],
        persistent_keepalive: u16,
    ) -> Result<(), PlatformError> {
        let owned: Vec<PeerOwned> = peers
            .iter()
            .map(|p| build_peer_owned(p, persistent_keepalive))
            .collect::<Result<_, _>>()?;

        let set_peers: Vec<set::Peer<'_>> = owned
            .iter()
            .map(|p| build_set_peer(p, vec![set::WgPeerF::ReplaceAllowedIps]))
            .collect();

        let dev = set::Device::from_ifname(name).peers(set_peers);

        let mut wg = WgSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
        wg.set_device(dev)
            .map_err(|e| PlatformError::Interface(e.to_string()))?;
        Ok(())
    }

    fn remove_peers(name: &str, pub_keys: &[&str]) -> Result<(), PlatformError> {
        let keys: Vec<[u8; 32]> = pub_keys
            .iter()
            .map(|k| decode_key(k))
            .collect::<Result<_, _>>()?;

        let set_peers: Vec<set::Peer<'_>> = keys
            .iter()
            .map(|k| set::Peer::from_public_key(k).flags(vec![set::WgPeerF::RemoveMe]))
            .collect();

        let dev = set::Device::from_ifname(name).peers(set_peers);

        let mut wg = WgSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
        wg.set_device(dev)
            .map_err(|e| PlatformError::Interface(e.to_string()))?;
        Ok(())
    }

    fn update_peers(
        name: &str,
        peers: &[&DesiredPeer],
        persistent_keepalive: u16,
    ) -> Result<(), PlatformError> {
        let owned: Vec<PeerOwned> = peers
            .iter()
            .map(|p| build_peer_owned(p, persistent_keepalive))
            .collect::<Result<_, _>>()?;

        let set_peers: Vec<set::Peer<'_>> = owned
            .iter()
            .map(|p| {
                build_set_peer(
                    p,
                    vec![set::WgPeerF::UpdateOnly, set::WgPeerF::ReplaceAllowedIps],
                )
            })
            .collect();

        let dev = set::Device::from_ifname(name).peers(set_peers);

        let mut wg = WgSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
        wg.set_device(dev)
            .map_err(|e| PlatformError::Interface(e.to_string()))?;
        Ok(())
    }

    struct PeerOwned {
        pub_key: [u8; 32],
        endpoint: Option<SocketAddr>,
        allowed_ips: Vec<(IpAddr, u8)>,
        persistent_keepalive: u16,
        preshared_key: Option<[u8; 32]>,
    }

    /// Resolve interface name to its index via rtnetlink.
    async fn get_link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32, PlatformError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?
            .ok_or_else(|| PlatformError::Interface(format!("interface {name} not found")))?;
        Ok(link.header.index)
    }

    async fn assign_address(name: &str, address: &str) -> Result<(), PlatformError> {
        let (addr, prefix) = if address.contains('/') {
            parse_cidr(address)?
        } else {
            let addr: IpAddr = address.parse()?;
            let prefix = if addr.is_ipv4() { 32 } else { 128 };
            (addr, prefix)
        };

        let (conn, handle, _) = rtnetlink::new_connection().map_err(PlatformError::Io)?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        let existing: Vec<_> = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        for addr_msg in existing {
            handle
                .address()
                .del(addr_msg)
                .execute()
                .await
                .map_err(|e| PlatformError::Interface(e.to_string()))?;
        }
        debug!(interface = name, "flushed existing addresses");

        handle
            .address()
            .add(index, addr, prefix)
            .execute()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        info!(interface = name, %addr, prefix, "assigned address via netlink");
        Ok(())
    }

    async fn set_link_up(name: &str) -> Result<(), PlatformError> {
        let (conn, handle, _) = rtnetlink::new_connection().map_err(PlatformError::Io)?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        let msg = rtnetlink::LinkUnspec::new_with_index(index).up().build();
        handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        info!(interface = name, "set link up via netlink");
        Ok(())
    }
}
