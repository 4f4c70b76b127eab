//! C4 VPN-ACL Table Builder (spec §4.4 "policy lattice").

use std::collections::{HashMap, HashSet};

use futures::future::BoxFuture;
use wirewarden_kernel::nft::build_chain;
use wirewarden_types::AclPolicy;

use crate::db::acl::AclStore;
use crate::db::peers::PeerStore;
use crate::firewall::{FirewallError, TableBuilder};

/// Translates peers + explicit ACL rules into a single forward chain
/// implementing the three-tier policy lattice.
pub struct AclTableBuilder {
    peers: PeerStore,
    acl: AclStore,
    vpn_ranges: Vec<String>,
    table_name: &'static str,
}

impl AclTableBuilder {
    pub fn new(peers: PeerStore, acl: AclStore, vpn_ranges: Vec<String>) -> Self {
        Self { peers, acl, vpn_ranges, table_name: "wirewarden_vpn_acl" }
    }
}

impl TableBuilder for AclTableBuilder {
    fn family(&self) -> &'static str {
        "inet"
    }

    fn name(&self) -> &'static str {
        self.table_name
    }

    fn priority(&self) -> i32 {
        10
    }

    fn set_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn build(&self) -> BoxFuture<'_, Result<String, FirewallError>> {
        Box::pin(async move {
            let peers = self.peers.list();
            let rules = self.acl.list().await?;

            let peer_by_id: HashMap<&str, _> = peers.iter().map(|p| (p.id.as_str(), p)).collect();
            let block_all: HashSet<&str> = peers
                .iter()
                .filter(|p| p.acl_policy == AclPolicy::BlockAll)
                .map(|p| p.id.as_str())
                .collect();
            let allow_all: HashSet<&str> = peers
                .iter()
                .filter(|p| p.acl_policy == AclPolicy::AllowAll)
                .map(|p| p.id.as_str())
                .collect();

            let mut rules_out: Vec<String> = Vec::new();
            let mut seen: HashSet<(String, String)> = HashSet::new();

            // 1. block_all isolates before any accept rule.
            for peer in peers.iter().filter(|p| block_all.contains(p.id.as_str())) {
                rules_out.push(format!("ip saddr {} drop", peer.address));
                rules_out.push(format!("ip daddr {} drop", peer.address));
            }

            // 2. allow_all: blanket accepts against every peer-CIDR range.
            for peer in peers.iter().filter(|p| allow_all.contains(p.id.as_str())) {
                for range in &self.vpn_ranges {
                    rules_out.push(format!("ip saddr {} ip daddr {range} accept", peer.address));
                    rules_out.push(format!("ip saddr {range} ip daddr {} accept", peer.address));
                }
            }

            // 3. selected: explicit accepts, skipping pairs already covered by
            // block_all or allow_all on either end, deduplicated.
            for rule in &rules {
                if block_all.contains(rule.source_peer_id.as_str())
                    || block_all.contains(rule.target_peer_id.as_str())
                    || allow_all.contains(rule.source_peer_id.as_str())
                    || allow_all.contains(rule.target_peer_id.as_str())
                {
                    continue;
                }
                let (Some(src), Some(dst)) = (
                    peer_by_id.get(rule.source_peer_id.as_str()),
                    peer_by_id.get(rule.target_peer_id.as_str()),
                ) else {
                    continue;
                };

                if seen.insert((src.address.clone(), dst.address.clone())) {
                    rules_out.push(format!("ip saddr {} ip daddr {} accept", src.address, dst.address));
                }
                if rule.bidirectional && seen.insert((dst.address.clone(), src.address.clone())) {
                    rules_out.push(format!("ip saddr {} ip daddr {} accept", dst.address, src.address));
                }
            }

            // Unmatched VPN traffic must fall through to drop despite the
            // chain's `accept` default policy.
            for range in &self.vpn_ranges {
                rules_out.push(format!("ip saddr {range} ip daddr {range} drop"));
            }
            for (i, a) in self.vpn_ranges.iter().enumerate() {
                for b in self.vpn_ranges.iter().skip(i + 1) {
                    rules_out.push(format!("ip saddr {a} ip daddr {b} drop"));
                    rules_out.push(format!("ip saddr {b} ip daddr {a} drop"));
                }
            }

            let chain = build_chain(
                "vpn_acl_forward",
                "filter",
                "forward",
                0,
                "accept",
                &rules_out.iter().map(String::as_str).collect::<Vec<_>>(),
            );

            Ok(format!("table inet {} {{\n{}\n}}\n", self.table_name, chain))
        })
    }
}
